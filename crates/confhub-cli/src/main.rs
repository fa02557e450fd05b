use std::process::ExitCode;

fn main() -> ExitCode {
    confhub_cli::run()
}

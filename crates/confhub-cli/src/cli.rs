//! confhub CLI - Inspect configuration resolution from a plugin manifest
//!
//! Usage:
//!   confhub get plugins.yaml MAX_UPLOAD_SIZE --user alice --repo repo1 --roles roles.yaml
//!   confhub check plugins.yaml
//!   confhub drivers plugins.yaml

use clap::{Parser, Subcommand};
use colored::Colorize;
use confhub_core::{
    ConfService, DriverCategory, PluginCatalog, PluginManifest, Principal, RequestEnvironment,
    ResolutionContext, Role, RoleBook, ServiceOptions, Value,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// confhub - Configuration resolution with pluggable drivers
#[derive(Parser)]
#[command(name = "confhub")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a configuration value of a core plugin
    Get {
        /// Plugin manifest (YAML or JSON)
        manifest: PathBuf,

        /// Configuration key (e.g., MAX_UPLOAD_SIZE)
        key: String,

        /// Core plugin to read the key from
        #[arg(short, long, default_value = "ajaxplorer")]
        core_type: String,

        /// Resolve as this user
        #[arg(short, long)]
        user: Option<String>,

        /// Resolve for this repository
        #[arg(short, long)]
        repo: Option<String>,

        /// Role book assigning roles to users
        #[arg(long, requires = "user")]
        roles: Option<PathBuf>,

        /// Output format: text, json, yaml
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Default value if key not found
        #[arg(short, long)]
        default: Option<String>,
    },

    /// Validate a manifest and boot a service from it
    Check {
        /// Plugin manifest (YAML or JSON)
        manifest: PathBuf,
    },

    /// Show the active driver of each category
    Drivers {
        /// Plugin manifest (YAML or JSON)
        manifest: PathBuf,

        /// Resolve drivers for this repository
        #[arg(short, long)]
        repo: Option<String>,
    },
}

/// Run the CLI with the given arguments
pub fn run() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Get {
            manifest,
            key,
            core_type,
            user,
            repo,
            roles,
            format,
            default,
        } => cmd_get(
            &manifest,
            &key,
            &core_type,
            user,
            repo,
            roles.as_deref(),
            &format,
            default,
        ),

        Commands::Check { manifest } => cmd_check(&manifest),

        Commands::Drivers { manifest, repo } => cmd_drivers(&manifest, repo),
    }
}

fn load_service(manifest: &Path) -> Result<ConfService, String> {
    let manifest = PluginManifest::from_file(manifest)
        .map_err(|e| format!("Failed to load {}: {}", manifest.display(), e))?;
    let options = ServiceOptions::default();

    Ok(ConfService::builder()
        .registry(Arc::new(PluginCatalog::from_manifest(manifest)))
        .options(options)
        .build())
}

fn build_context(
    user: Option<String>,
    repo: Option<String>,
    roles: Option<&RoleBook>,
) -> ResolutionContext {
    let ctx = match user {
        Some(user) => {
            let role = roles
                .map(|book| book.merged_for(&user))
                .unwrap_or_else(|| Role::new(format!("merged:{}", user)));
            ResolutionContext::for_principal(Principal::new(user, Arc::new(role)))
        }
        None => ResolutionContext::empty(),
    };

    match repo {
        Some(repo) => ctx.with_repository(repo),
        None => ctx,
    }
}

/// Warning when the active auth driver does not know `user`
fn unknown_user_warning(service: &ConfService, user: &str) -> Option<String> {
    match service.auth_driver() {
        Ok(auth) if !auth.user_exists(user) => Some(format!(
            "user '{}' is unknown to auth driver '{}'",
            user,
            auth.name()
        )),
        Ok(_) => None,
        Err(e) if e.is_driver_not_found() => None,
        Err(e) => Some(format!("cannot check user '{}': {}", user, e)),
    }
}

fn format_value(value: &Value, format: &str) -> Result<String, String> {
    match format {
        "json" => serde_json::to_string_pretty(value)
            .map(|s| format!("{}\n", s))
            .map_err(|e| format!("Failed to serialize value: {}", e)),
        "yaml" => serde_yaml::to_string(value).map_err(|e| format!("Failed to serialize value: {}", e)),
        _ => match value {
            // Complex values are shown as YAML
            Value::Sequence(_) | Value::Mapping(_) => format_value(value, "yaml"),
            scalar => Ok(format!("{}\n", scalar)),
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_get(
    manifest: &Path,
    key: &str,
    core_type: &str,
    user: Option<String>,
    repo: Option<String>,
    roles: Option<&Path>,
    format: &str,
    default: Option<String>,
) -> ExitCode {
    let service = match load_service(manifest) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e.red());
            return ExitCode::from(2);
        }
    };

    let book = match roles.map(RoleBook::from_file).transpose() {
        Ok(book) => book,
        Err(e) => {
            eprintln!("{}", e.to_string().red());
            return ExitCode::from(2);
        }
    };

    if let Some(user) = &user {
        if let Some(warning) = unknown_user_warning(&service, user) {
            eprintln!("{}: {}", "Warning".yellow(), warning);
        }
    }

    let ctx = build_context(user, repo, book.as_ref());
    match service.get_context_config_in(&ctx, core_type, key) {
        Some(value) => match format_value(&value, format) {
            Ok(output) => {
                print!("{}", output);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                ExitCode::from(1)
            }
        },
        None => {
            if let Some(default_val) = default {
                println!("{}", default_val);
                ExitCode::SUCCESS
            } else {
                eprintln!(
                    "{}: Key '{}' not found in core.{}",
                    "Error".red(),
                    key,
                    core_type
                );
                ExitCode::from(1)
            }
        }
    }
}

fn cmd_check(manifest: &Path) -> ExitCode {
    let mut service = match load_service(manifest) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            return ExitCode::from(2);
        }
    };
    println!("{} {}: valid manifest", "✓".green(), manifest.display());

    service.init(&RequestEnvironment::from_env());
    let started = service.start();
    let errors = service.errors();

    for error in &errors {
        eprintln!("{} {}", "✗".red(), error);
    }

    match started {
        Ok(()) if errors.is_empty() => {
            println!("{} service started", "✓".green());
            ExitCode::SUCCESS
        }
        Ok(()) => {
            eprintln!(
                "{} service started with {} boot error(s)",
                "✗".red(),
                errors.len()
            );
            ExitCode::from(1)
        }
        Err(_) => {
            eprintln!("{} service failed to start", "✗".red());
            ExitCode::from(1)
        }
    }
}

fn cmd_drivers(manifest: &Path, repo: Option<String>) -> ExitCode {
    let service = match load_service(manifest) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e.red());
            return ExitCode::from(2);
        }
    };

    let ctx = build_context(None, repo, None);
    let mut all_found = true;

    for category in DriverCategory::ALL {
        match service.resolve_driver(category, &ctx) {
            Ok(driver) => println!("{} {}: {}", "✓".green(), category, driver.name()),
            // A missing cache driver only disables caching
            Err(e) if category == DriverCategory::Cache && e.is_driver_not_found() => {
                println!("{} {}: {}", "-".yellow(), category, "disabled".dimmed())
            }
            Err(e) => {
                eprintln!("{} {}: {}", "✗".red(), category, e);
                all_found = false;
            }
        }
    }

    if let Ok(info) = service.info() {
        println!("  {} {}", "auth stats:".dimmed(), info);
    }
    if service.background_actions_supported() {
        println!("  {}", "background actions enabled".dimmed());
    }

    if all_found {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

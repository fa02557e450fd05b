//! Error types for confhub
//!
//! Errors are structured: a kind, the plugin involved (if any), the
//! underlying cause and an actionable help message.

use std::fmt;

use crate::driver::DriverCategory;
use crate::service::LifecycleState;

/// Result type alias for confhub operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for confhub operations
#[derive(Debug, Clone)]
pub struct Error {
    /// The kind of error that occurred
    pub kind: ErrorKind,
    /// Plugin id the error relates to (e.g., "core.conf", "conf.memory")
    pub plugin: Option<String>,
    /// Actionable help message
    pub help: Option<String>,
    /// Underlying cause (as string for Clone compatibility)
    pub cause: Option<String>,
}

/// Categories of errors that can occur
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// No plugin is active for a driver category
    #[error("No active {category} driver")]
    DriverNotFound { category: DriverCategory },
    /// The registry could not construct a plugin
    #[error("Failed to instantiate plugin '{plugin}'")]
    PluginInstantiation { plugin: String },
    /// A plugin was found but does not implement the requested category
    #[error("Plugin '{plugin}' is not a {expected} driver")]
    DriverMismatch {
        plugin: String,
        expected: DriverCategory,
    },
    /// A lifecycle operation was called in the wrong state
    #[error("Lifecycle error: expected {expected} state, service is {actual}")]
    Lifecycle {
        expected: LifecycleState,
        actual: LifecycleState,
    },
    /// One step of a cache cascade failed
    #[error("Failed to clear {target}")]
    Cache { target: String },
    /// Error parsing a manifest or role file
    #[error("Parse error")]
    Parse,
    /// Manifest did not match the manifest schema
    #[error("Validation error")]
    Validation,
    /// Internal error (bug in confhub)
    #[error("Internal error")]
    Internal,
}

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            plugin: None,
            help: None,
            cause: None,
        }
    }

    /// Create a driver not found error
    pub fn driver_not_found(category: DriverCategory) -> Self {
        Self {
            plugin: Some(category.plugin_id().to_string()),
            help: Some(format!(
                "Register and activate a plugin of type '{}', or install driver overrides",
                category
            )),
            ..Self::from_kind(ErrorKind::DriverNotFound { category })
        }
    }

    /// Create a plugin instantiation error
    pub fn plugin_instantiation(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        let plugin = plugin.into();
        Self {
            plugin: Some(plugin.clone()),
            cause: Some(message.into()),
            help: Some(format!(
                "Check that a driver factory is registered for '{}' and that its parameters are valid",
                plugin
            )),
            ..Self::from_kind(ErrorKind::PluginInstantiation { plugin })
        }
    }

    /// Create a driver mismatch error
    pub fn driver_mismatch(plugin: impl Into<String>, expected: DriverCategory) -> Self {
        let plugin = plugin.into();
        Self {
            plugin: Some(plugin.clone()),
            ..Self::from_kind(ErrorKind::DriverMismatch { plugin, expected })
        }
    }

    /// Create a lifecycle error
    pub fn lifecycle(expected: LifecycleState, actual: LifecycleState) -> Self {
        let help = match expected {
            LifecycleState::Initialized => "Call init() before start()",
            _ => "Check the order of lifecycle calls",
        };
        Self {
            help: Some(help.into()),
            ..Self::from_kind(ErrorKind::Lifecycle { expected, actual })
        }
    }

    /// Create a cache cascade error
    pub fn cache(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            cause: Some(message.into()),
            ..Self::from_kind(ErrorKind::Cache {
                target: target.into(),
            })
        }
    }

    /// Create a parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            cause: Some(message.into()),
            ..Self::from_kind(ErrorKind::Parse)
        }
    }

    /// Create a validation error
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        let p = path.into();
        let cause = if p.is_empty() {
            message.into()
        } else {
            format!("{}: {}", p, message.into())
        };
        Self {
            help: Some("Fix the manifest to match the plugin manifest schema".into()),
            cause: Some(cause),
            ..Self::from_kind(ErrorKind::Validation)
        }
    }

    /// Create an internal error (bug in confhub)
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            help: Some("This is likely a bug in confhub. Please report it.".into()),
            cause: Some(message.into()),
            ..Self::from_kind(ErrorKind::Internal)
        }
    }

    /// Add plugin context to the error
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    /// Add help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Whether this error means a driver category has no active plugin
    pub fn is_driver_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::DriverNotFound { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;

        if let Some(plugin) = &self.plugin {
            write!(f, "\n  Plugin: {}", plugin)?;
        }

        if let Some(cause) = &self.cause {
            write!(f, "\n  {}", cause)?;
        }

        if let Some(help) = &self.help {
            write!(f, "\n  Help: {}", help)?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_not_found_display() {
        let err = Error::driver_not_found(DriverCategory::Conf);
        let display = format!("{}", err);

        assert!(display.contains("No active conf driver"));
        assert!(display.contains("Plugin: core.conf"));
        assert!(display.contains("Help:"));
        assert!(err.is_driver_not_found());
    }

    #[test]
    fn test_plugin_instantiation_display() {
        let err = Error::plugin_instantiation("conf.sql", "connection refused");
        let display = format!("{}", err);

        assert!(display.contains("Failed to instantiate plugin 'conf.sql'"));
        assert!(display.contains("connection refused"));
        assert!(!err.is_driver_not_found());
    }

    #[test]
    fn test_driver_mismatch_display() {
        let err = Error::driver_mismatch("auth.memory", DriverCategory::Conf);
        assert_eq!(
            err.kind,
            ErrorKind::DriverMismatch {
                plugin: "auth.memory".into(),
                expected: DriverCategory::Conf,
            }
        );
        assert!(format!("{}", err).contains("is not a conf driver"));
    }

    #[test]
    fn test_lifecycle_error_help() {
        let err = Error::lifecycle(LifecycleState::Initialized, LifecycleState::Uninitialized);
        let display = format!("{}", err);

        assert!(display.contains("expected initialized state, service is uninitialized"));
        assert!(display.contains("Help: Call init() before start()"));
    }

    #[test]
    fn test_cache_error_display() {
        let err = Error::cache("locale messages cache", "disk full");
        let display = format!("{}", err);

        assert!(display.contains("Failed to clear locale messages cache"));
        assert!(display.contains("disk full"));
    }

    #[test]
    fn test_validation_error_without_path() {
        let err = Error::validation("", "missing required field");
        assert_eq!(err.cause.as_deref(), Some("missing required field"));

        let err = Error::validation("/plugins/0", "missing name");
        assert_eq!(err.cause.as_deref(), Some("/plugins/0: missing name"));
    }

    #[test]
    fn test_builders() {
        let err = Error::parse("bad input")
            .with_plugin("boot.conf")
            .with_help("Try fixing the syntax");
        let display = format!("{}", err);

        assert!(display.contains("Parse error"));
        assert!(display.contains("Plugin: boot.conf"));
        assert!(display.contains("Help: Try fixing the syntax"));
    }
}

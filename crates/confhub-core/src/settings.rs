//! Global settings store
//!
//! A flat map of process-wide settings (install flags, debug flags, TLS
//! flag) that are not tied to any plugin. Lookups check values set at
//! runtime first, then the typed defaults captured at startup.

use std::sync::{PoisonError, RwLock};

use indexmap::IndexMap;

use crate::value::Value;

/// Default environment variable prefix for settings defaults
pub const DEFAULT_ENV_PREFIX: &str = "CONFHUB";

/// Settings defaults captured once at startup.
///
/// Each field is read from `<PREFIX>_<KEY>` by [`SettingsDefaults::from_env`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsDefaults {
    /// `INSTALL_PATH`
    pub install_path: Option<String>,
    /// `DATA_PATH`
    pub data_path: Option<String>,
    /// `CLIENT_DEBUG`, served as `JS_DEBUG`
    pub client_debug: bool,
    /// `SERVER_DEBUG`
    pub server_debug: bool,
    /// `CMDLINE_ACTIVE`
    pub cmdline_active: bool,
    /// `VERSION`
    pub version: Option<String>,
}

impl SettingsDefaults {
    /// Read defaults from the process environment
    pub fn from_env(prefix: &str) -> Self {
        Self::from_lookup(prefix, |name| std::env::var(name).ok())
    }

    /// Read defaults through an arbitrary variable lookup
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(&format!("{}_{}", prefix, key));
        let flag = |key: &str| var(key).is_some_and(|v| Value::String(v).is_truthy());

        Self {
            install_path: var("INSTALL_PATH"),
            data_path: var("DATA_PATH"),
            client_debug: flag("CLIENT_DEBUG"),
            server_debug: flag("SERVER_DEBUG"),
            cmdline_active: flag("CMDLINE_ACTIVE"),
            version: var("VERSION"),
        }
    }

    /// Default value of a known setting key
    pub fn lookup(&self, key: &str) -> Option<Value> {
        match key {
            "INSTALL_PATH" => self.install_path.clone().map(Value::String),
            "DATA_PATH" => self.data_path.clone().map(Value::String),
            "JS_DEBUG" | "CLIENT_DEBUG" => Some(Value::Bool(self.client_debug)),
            "SERVER_DEBUG" => Some(Value::Bool(self.server_debug)),
            "CMDLINE_ACTIVE" => Some(Value::Bool(self.cmdline_active)),
            "VERSION" => self.version.clone().map(Value::String),
            _ => None,
        }
    }
}

/// Facts about the inbound request that boot flags are derived from
#[derive(Debug, Clone, Default)]
pub struct RequestEnvironment {
    https: Option<String>,
}

impl RequestEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the CGI-style `HTTPS` variable from the process environment
    pub fn from_env() -> Self {
        Self {
            https: std::env::var("HTTPS").ok(),
        }
    }

    /// Set the request's HTTPS indicator (e.g. "on")
    pub fn with_https(mut self, indicator: impl Into<String>) -> Self {
        self.https = Some(indicator.into());
        self
    }

    /// Whether the request arrived over TLS
    pub fn is_https(&self) -> bool {
        self.https
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case("on"))
    }
}

/// Process-wide settings, shared by the service and the substitution engine
#[derive(Debug, Default)]
pub struct GlobalSettings {
    values: RwLock<IndexMap<String, Value>>,
    defaults: SettingsDefaults,
}

impl GlobalSettings {
    pub fn new(defaults: SettingsDefaults) -> Self {
        Self {
            values: RwLock::new(IndexMap::new()),
            defaults,
        }
    }

    /// Value of a setting: runtime value first, then the startup default
    pub fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values
            .get(key)
            .cloned()
            .or_else(|| self.defaults.lookup(key))
    }

    /// Set a setting, shadowing any default from then on
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.into(), value.into());
    }

    /// Remove a runtime value, exposing the default again
    pub fn unset(&self, key: &str) -> Option<Value> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.shift_remove(key)
    }

    pub fn defaults(&self) -> &SettingsDefaults {
        &self.defaults
    }

    /// Copy of all runtime values, in insertion order
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

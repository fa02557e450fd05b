//! Driver categories and capability traits
//!
//! Configuration storage, authentication and caching are reached through
//! one capability trait per category. The active implementation of each
//! category is chosen at runtime, either from the plugin registry or from
//! the override slot installed on the service.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::{ConfigMap, Value};

/// The three pluggable driver categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverCategory {
    /// Configuration storage
    Conf,
    /// Authentication backend
    Auth,
    /// Cache backend
    Cache,
}

impl DriverCategory {
    /// All categories, in boot order
    pub const ALL: [DriverCategory; 3] = [
        DriverCategory::Conf,
        DriverCategory::Auth,
        DriverCategory::Cache,
    ];

    /// Plugin type name of this category ("conf", "auth", "cache")
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverCategory::Conf => "conf",
            DriverCategory::Auth => "auth",
            DriverCategory::Cache => "cache",
        }
    }

    /// Id of the core plugin that exposes the active driver of this category
    pub fn plugin_id(&self) -> &'static str {
        match self {
            DriverCategory::Conf => "core.conf",
            DriverCategory::Auth => "core.auth",
            DriverCategory::Cache => "core.cache",
        }
    }
}

impl fmt::Display for DriverCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conf" => Ok(DriverCategory::Conf),
            "auth" => Ok(DriverCategory::Auth),
            "cache" => Ok(DriverCategory::Cache),
            other => Err(Error::parse(format!("Unknown driver category '{}'", other))
                .with_help("Use one of: conf, auth, cache")),
        }
    }
}

/// Behavior shared by every driver
pub trait Driver: Send + Sync {
    /// Plugin name of the driver (e.g. "memory", "sql")
    fn name(&self) -> &str;

    /// Sanity checks run after the driver is instantiated from parameters
    fn perform_checks(&self) -> Result<()> {
        Ok(())
    }
}

/// Configuration storage driver
pub trait ConfDriver: Driver {
    /// Post-load setup run once the driver is the active conf driver.
    ///
    /// This is where a driver loads any extension code it declares.
    fn load_extension(&self) -> Result<()> {
        Ok(())
    }
}

/// Authentication driver
pub trait AuthDriver: Driver {
    /// Whether a user id is known to this backend
    fn user_exists(&self, user_id: &str) -> bool;

    /// Short usage summary reported to operators
    fn stats(&self) -> String {
        String::new()
    }
}

/// Cache driver, namespaced key/value storage
pub trait CacheDriver: Driver {
    /// Fetch a cached value
    fn fetch(&self, namespace: &str, key: &str) -> Option<Value>;

    /// Store a value
    fn save(&self, namespace: &str, key: &str, value: Value) -> Result<()>;

    /// Drop every entry of a namespace
    fn delete_all(&self, namespace: &str) -> Result<()>;
}

/// A type-erased handle to a driver instance of any category
#[derive(Clone)]
pub enum DriverHandle {
    Conf(Arc<dyn ConfDriver>),
    Auth(Arc<dyn AuthDriver>),
    Cache(Arc<dyn CacheDriver>),
}

impl DriverHandle {
    /// Category implemented by this driver
    pub fn category(&self) -> DriverCategory {
        match self {
            DriverHandle::Conf(_) => DriverCategory::Conf,
            DriverHandle::Auth(_) => DriverCategory::Auth,
            DriverHandle::Cache(_) => DriverCategory::Cache,
        }
    }

    /// Plugin name of the driver
    pub fn name(&self) -> &str {
        match self {
            DriverHandle::Conf(d) => d.name(),
            DriverHandle::Auth(d) => d.name(),
            DriverHandle::Cache(d) => d.name(),
        }
    }

    /// Run the driver's own checks
    pub fn perform_checks(&self) -> Result<()> {
        match self {
            DriverHandle::Conf(d) => d.perform_checks(),
            DriverHandle::Auth(d) => d.perform_checks(),
            DriverHandle::Cache(d) => d.perform_checks(),
        }
    }

    pub fn as_conf(&self) -> Option<Arc<dyn ConfDriver>> {
        match self {
            DriverHandle::Conf(d) => Some(Arc::clone(d)),
            _ => None,
        }
    }

    pub fn as_auth(&self) -> Option<Arc<dyn AuthDriver>> {
        match self {
            DriverHandle::Auth(d) => Some(Arc::clone(d)),
            _ => None,
        }
    }

    pub fn as_cache(&self) -> Option<Arc<dyn CacheDriver>> {
        match self {
            DriverHandle::Cache(d) => Some(Arc::clone(d)),
            _ => None,
        }
    }

    /// Whether both handles point at the same driver instance
    pub fn same_instance(&self, other: &DriverHandle) -> bool {
        match (self, other) {
            (DriverHandle::Conf(a), DriverHandle::Conf(b)) => Arc::ptr_eq(a, b),
            (DriverHandle::Auth(a), DriverHandle::Auth(b)) => Arc::ptr_eq(a, b),
            (DriverHandle::Cache(a), DriverHandle::Cache(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle")
            .field("category", &self.category())
            .field("name", &self.name())
            .finish()
    }
}

/// Drivers force-installed on the service, bypassing the registry.
///
/// The three categories are always installed together.
#[derive(Clone)]
pub struct DriverOverrides {
    pub conf: Arc<dyn ConfDriver>,
    pub auth: Arc<dyn AuthDriver>,
    pub cache: Arc<dyn CacheDriver>,
}

impl DriverOverrides {
    pub fn new(
        conf: Arc<dyn ConfDriver>,
        auth: Arc<dyn AuthDriver>,
        cache: Arc<dyn CacheDriver>,
    ) -> Self {
        Self { conf, auth, cache }
    }

    /// Handle of the overriding driver for a category
    pub fn handle(&self, category: DriverCategory) -> DriverHandle {
        match category {
            DriverCategory::Conf => DriverHandle::Conf(Arc::clone(&self.conf)),
            DriverCategory::Auth => DriverHandle::Auth(Arc::clone(&self.auth)),
            DriverCategory::Cache => DriverHandle::Cache(Arc::clone(&self.cache)),
        }
    }
}

impl fmt::Debug for DriverOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverOverrides")
            .field("conf", &self.conf.name())
            .field("auth", &self.auth.name())
            .field("cache", &self.cache.name())
            .finish()
    }
}

type ExtensionHook = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// In-process configuration driver
pub struct MemoryConfDriver {
    name: String,
    extension: Option<ExtensionHook>,
}

impl MemoryConfDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extension: None,
        }
    }

    /// Attach extension code run by [`ConfDriver::load_extension`]
    pub fn with_extension<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.extension = Some(Arc::new(hook));
        self
    }
}

impl Driver for MemoryConfDriver {
    fn name(&self) -> &str {
        &self.name
    }
}

impl ConfDriver for MemoryConfDriver {
    fn load_extension(&self) -> Result<()> {
        match &self.extension {
            Some(hook) => {
                log::debug!("Loading extension of conf driver '{}'", self.name);
                hook()
            }
            None => Ok(()),
        }
    }
}

/// In-process authentication driver backed by a fixed user list
pub struct MemoryAuthDriver {
    name: String,
    users: Vec<String>,
}

impl MemoryAuthDriver {
    pub fn new(name: impl Into<String>, users: Vec<String>) -> Self {
        Self {
            name: name.into(),
            users,
        }
    }
}

impl Driver for MemoryAuthDriver {
    fn name(&self) -> &str {
        &self.name
    }
}

impl AuthDriver for MemoryAuthDriver {
    fn user_exists(&self, user_id: &str) -> bool {
        self.users.iter().any(|u| u == user_id)
    }

    fn stats(&self) -> String {
        format!("{}:{}", self.name, self.users.len())
    }
}

/// In-process cache driver
pub struct MemoryCacheDriver {
    name: String,
    namespaces: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryCacheDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    /// Number of entries stored in a namespace
    pub fn len(&self, namespace: &str) -> usize {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        namespaces.get(namespace).map_or(0, |ns| ns.len())
    }

    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }
}

impl Driver for MemoryCacheDriver {
    fn name(&self) -> &str {
        &self.name
    }
}

impl CacheDriver for MemoryCacheDriver {
    fn fetch(&self, namespace: &str, key: &str) -> Option<Value> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        namespaces.get(namespace)?.get(key).cloned()
    }

    fn save(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete_all(&self, namespace: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(removed) = namespaces.remove(namespace) {
            log::trace!(
                "Cache '{}' dropped {} entries from namespace '{}'",
                self.name,
                removed.len(),
                namespace
            );
        }
        Ok(())
    }
}

/// Build a [`MemoryConfDriver`] from plugin parameters
pub fn memory_conf_factory(name: &str, _params: &ConfigMap) -> Result<DriverHandle> {
    Ok(DriverHandle::Conf(Arc::new(MemoryConfDriver::new(name))))
}

/// Build a [`MemoryAuthDriver`] from plugin parameters.
///
/// Reads the optional `users` sequence parameter.
pub fn memory_auth_factory(name: &str, params: &ConfigMap) -> Result<DriverHandle> {
    let users = match params.get("users") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                other => Err(Error::plugin_instantiation(
                    format!("auth.{}", name),
                    format!("users entries must be strings, got {}", other.type_name()),
                )),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(Error::plugin_instantiation(
                format!("auth.{}", name),
                format!("users must be a sequence, got {}", other.type_name()),
            ))
        }
    };
    Ok(DriverHandle::Auth(Arc::new(MemoryAuthDriver::new(name, users))))
}

/// Build a [`MemoryCacheDriver`] from plugin parameters
pub fn memory_cache_factory(name: &str, _params: &ConfigMap) -> Result<DriverHandle> {
    Ok(DriverHandle::Cache(Arc::new(MemoryCacheDriver::new(name))))
}

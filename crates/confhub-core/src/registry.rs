//! Plugin registry
//!
//! The registry knows which plugins are declared, which one is active for
//! each driver category, and how to build driver instances from named
//! factories. [`PluginRegistry`] is the contract the service consumes;
//! [`PluginCatalog`] is the in-process implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::context::ResolutionContext;
use crate::driver::{self, DriverCategory, DriverHandle};
use crate::error::{Error, ErrorKind, Result};
use crate::schema::ManifestSchema;
use crate::value::ConfigMap;

/// Builds a driver from a plugin name and its instantiation parameters
pub type DriverFactory = Arc<dyn Fn(&str, &ConfigMap) -> Result<DriverHandle> + Send + Sync>;

/// A declared plugin, as seen by registry consumers
#[derive(Debug, Clone, PartialEq)]
pub struct Plugin {
    plugin_type: String,
    name: String,
    configs: ConfigMap,
    active: bool,
}

impl Plugin {
    /// Plugin id (`type.name`)
    pub fn id(&self) -> String {
        plugin_id(&self.plugin_type, &self.name)
    }

    pub fn plugin_type(&self) -> &str {
        &self.plugin_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared configuration of the plugin
    pub fn configs(&self) -> &ConfigMap {
        &self.configs
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Contract of the plugin registry consumed by the service
pub trait PluginRegistry: Send + Sync {
    /// Look up a declared plugin by id, as visible under `ctx`
    fn plugin_by_id(&self, id: &str, ctx: &ResolutionContext) -> Option<Plugin>;

    /// Look up a declared plugin by type and name, as visible under `ctx`
    fn plugin_by_type_name(
        &self,
        plugin_type: &str,
        name: &str,
        ctx: &ResolutionContext,
    ) -> Option<Plugin>;

    /// Mark `name` as the only active plugin of `plugin_type`
    fn set_plugin_unique_active_for_type(&self, plugin_type: &str, name: &str) -> Result<()>;

    /// Instance of a declared plugin, built on first access and memoized
    fn instance(&self, id: &str, ctx: &ResolutionContext) -> Result<DriverHandle>;

    /// Build a plugin outside the registry's bookkeeping
    fn soft_load(&self, id: &str, params: &ConfigMap) -> Result<DriverHandle>;

    /// Driver of the plugin currently active for `category` under `ctx`
    fn driver(&self, category: DriverCategory, ctx: &ResolutionContext) -> Result<DriverHandle>;

    /// Drop memoized plugin instances and lookup caches
    fn clear_cache(&self) -> Result<()>;

    /// Drop per-context lookup caches only
    fn clear_registry_caches(&self);
}

/// Declaration of one plugin in a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub active: bool,
    /// Declared configuration defaults
    #[serde(default)]
    pub configs: ConfigMap,
    /// Parameters passed to the driver factory
    #[serde(default)]
    pub params: ConfigMap,
    /// Repositories under which this plugin is not visible
    #[serde(default)]
    pub disabled_repositories: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl PluginSpec {
    pub fn new(plugin_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            plugin_type: plugin_type.into(),
            name: name.into(),
            enabled: true,
            active: false,
            configs: ConfigMap::new(),
            params: ConfigMap::new(),
            disabled_repositories: Vec::new(),
        }
    }

    pub fn active(mut self) -> Self {
        self.active = true;
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<crate::Value>) -> Self {
        self.configs.insert(key.into(), value.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<crate::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn disabled_for(mut self, repository_id: impl Into<String>) -> Self {
        self.disabled_repositories.push(repository_id.into());
        self
    }

    pub fn id(&self) -> String {
        plugin_id(&self.plugin_type, &self.name)
    }

    fn visible_in(&self, ctx: &ResolutionContext) -> bool {
        self.enabled
            && ctx
                .repository_id()
                .is_none_or(|repo| !self.disabled_repositories.iter().any(|r| r == repo))
    }

    fn to_plugin(&self) -> Plugin {
        Plugin {
            plugin_type: self.plugin_type.clone(),
            name: self.name.clone(),
            configs: self.configs.clone(),
            active: self.active,
        }
    }
}

/// A list of plugin declarations, loaded from YAML or JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
}

impl PluginManifest {
    /// Parse and validate a YAML manifest
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: serde_json::Value = serde_yaml::from_str(yaml)
            .map_err(|e| Error::parse(format!("Invalid YAML manifest: {}", e)))?;
        Self::from_document(document)
    }

    /// Parse and validate a JSON manifest
    pub fn from_json(json: &str) -> Result<Self> {
        let document: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| Error::parse(format!("Invalid JSON manifest: {}", e)))?;
        Self::from_document(document)
    }

    /// Load a manifest file (JSON or YAML based on extension)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::parse(format!("Failed to read file '{}': {}", path.display(), e))
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    fn from_document(document: serde_json::Value) -> Result<Self> {
        ManifestSchema::get()?.validate(&document)?;
        serde_json::from_value(document).map_err(|e| Error::parse(e.to_string()))
    }
}

#[derive(Default)]
struct CatalogState {
    plugins: IndexMap<String, PluginSpec>,
    /// Memoized driver instances, by plugin id
    instances: HashMap<String, DriverHandle>,
    /// Active plugin id per (category, repository)
    lookups: HashMap<(DriverCategory, Option<String>), String>,
}

impl CatalogState {
    fn active_plugin_id(&self, category: DriverCategory, ctx: &ResolutionContext) -> Option<String> {
        let candidates = || {
            self.plugins
                .values()
                .filter(|spec| spec.plugin_type == category.as_str() && spec.visible_in(ctx))
        };
        candidates()
            .find(|spec| spec.active)
            .or_else(|| candidates().next())
            .map(PluginSpec::id)
    }
}

/// In-process plugin registry
pub struct PluginCatalog {
    factories: HashMap<String, DriverFactory>,
    state: RwLock<CatalogState>,
}

impl Default for PluginCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginCatalog {
    /// Create an empty catalog with no factories
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            state: RwLock::new(CatalogState::default()),
        }
    }

    /// Create a catalog with the built-in in-memory driver factories
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register_builtin_factories();
        catalog
    }

    /// Create a catalog with built-in factories and the manifest's plugins
    pub fn from_manifest(manifest: PluginManifest) -> Self {
        let catalog = Self::with_builtins();
        for spec in manifest.plugins {
            catalog.add_plugin(spec);
        }
        catalog
    }

    fn register_builtin_factories(&mut self) {
        self.register_fn("conf.memory", driver::memory_conf_factory);
        self.register_fn("auth.memory", driver::memory_auth_factory);
        self.register_fn("cache.memory", driver::memory_cache_factory);
        // Boot-time conf storage used before the registry is populated
        self.register_fn("boot.conf", driver::memory_conf_factory);
    }

    /// Register a driver factory for a plugin id (`type.name`)
    pub fn register_factory(&mut self, id: impl Into<String>, factory: DriverFactory) {
        self.factories.insert(id.into(), factory);
    }

    /// Register a function as a driver factory
    pub fn register_fn<F>(&mut self, id: impl Into<String>, func: F)
    where
        F: Fn(&str, &ConfigMap) -> Result<DriverHandle> + Send + Sync + 'static,
    {
        self.register_factory(id, Arc::new(func));
    }

    /// Declare a plugin, replacing any previous declaration with the same id
    pub fn add_plugin(&self, spec: PluginSpec) {
        let id = spec.id();
        let mut state = self.write_state();
        state.instances.remove(&id);
        state.lookups.clear();
        state.plugins.insert(id, spec);
    }

    /// Ids of all declared plugins, in declaration order
    pub fn plugin_ids(&self) -> Vec<String> {
        self.read_state().plugins.keys().cloned().collect()
    }

    /// Whether a plugin instance is currently memoized
    pub fn is_instantiated(&self, id: &str) -> bool {
        self.read_state().instances.contains_key(id)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn build(&self, id: &str, name: &str, params: &ConfigMap) -> Result<DriverHandle> {
        let factory = self.factories.get(id).ok_or_else(|| {
            Error::plugin_instantiation(id, "no driver factory registered for this plugin")
        })?;

        let handle = factory(name, params).map_err(|e| match e.kind {
            ErrorKind::PluginInstantiation { .. } => e,
            _ => Error::plugin_instantiation(id, e.to_string()),
        })?;

        // A plugin of a driver type must build a driver of that category
        if let Ok(category) = id.split('.').next().unwrap_or_default().parse::<DriverCategory>() {
            if handle.category() != category {
                return Err(Error::driver_mismatch(id, category));
            }
        }

        Ok(handle)
    }
}

impl PluginRegistry for PluginCatalog {
    fn plugin_by_id(&self, id: &str, ctx: &ResolutionContext) -> Option<Plugin> {
        let state = self.read_state();
        state
            .plugins
            .get(id)
            .filter(|spec| spec.visible_in(ctx))
            .map(PluginSpec::to_plugin)
    }

    fn plugin_by_type_name(
        &self,
        plugin_type: &str,
        name: &str,
        ctx: &ResolutionContext,
    ) -> Option<Plugin> {
        self.plugin_by_id(&plugin_id(plugin_type, name), ctx)
    }

    fn set_plugin_unique_active_for_type(&self, plugin_type: &str, name: &str) -> Result<()> {
        let mut state = self.write_state();
        if !state.plugins.contains_key(&plugin_id(plugin_type, name)) {
            log::debug!(
                "Plugin '{}' is not declared, leaving '{}' activation unchanged",
                plugin_id(plugin_type, name),
                plugin_type
            );
            return Ok(());
        }

        for spec in state.plugins.values_mut() {
            if spec.plugin_type == plugin_type {
                spec.active = spec.name == name;
            }
        }
        state.lookups.clear();
        log::debug!("Plugin '{}' is now the only active {} plugin", name, plugin_type);
        Ok(())
    }

    fn instance(&self, id: &str, ctx: &ResolutionContext) -> Result<DriverHandle> {
        let spec = {
            let state = self.read_state();
            if let Some(handle) = state.instances.get(id) {
                return Ok(handle.clone());
            }
            state
                .plugins
                .get(id)
                .filter(|spec| spec.visible_in(ctx))
                .cloned()
                .ok_or_else(|| {
                    Error::plugin_instantiation(id, "plugin is not declared or not visible")
                })?
        };

        let handle = self.build(id, &spec.name, &spec.params)?;
        log::debug!("Instantiated plugin '{}'", id);

        // Another caller may have raced us; keep the first instance
        let mut state = self.write_state();
        Ok(state.instances.entry(id.to_string()).or_insert(handle).clone())
    }

    fn soft_load(&self, id: &str, params: &ConfigMap) -> Result<DriverHandle> {
        let name = id.split_once('.').map_or(id, |(_, name)| name);
        let mut merged = {
            let state = self.read_state();
            state
                .plugins
                .get(id)
                .map(|spec| spec.params.clone())
                .unwrap_or_default()
        };
        merged.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));

        log::trace!("Soft-loading plugin '{}'", id);
        self.build(id, name, &merged)
    }

    fn driver(&self, category: DriverCategory, ctx: &ResolutionContext) -> Result<DriverHandle> {
        let key = (category, ctx.repository_id().map(str::to_string));
        let cached = self.read_state().lookups.get(&key).cloned();

        let id = match cached {
            Some(id) => id,
            None => {
                let mut state = self.write_state();
                let id = state
                    .active_plugin_id(category, ctx)
                    .ok_or_else(|| Error::driver_not_found(category))?;
                state.lookups.insert(key, id.clone());
                id
            }
        };

        self.instance(&id, ctx)
    }

    fn clear_cache(&self) -> Result<()> {
        let mut state = self.write_state();
        state.instances.clear();
        state.lookups.clear();
        log::debug!("Cleared plugin cache");
        Ok(())
    }

    fn clear_registry_caches(&self) {
        self.write_state().lookups.clear();
    }
}

/// Plugin id of a (type, name) pair
pub fn plugin_id(plugin_type: &str, name: &str) -> String {
    format!("{}.{}", plugin_type, name)
}

//! The configuration service
//!
//! [`ConfService`] owns the driver override slot, the global settings and
//! the lifecycle state, and resolves configuration values through its
//! collaborators. Build it once at process start with
//! [`ConfService::builder`] and share it by reference.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::{CacheCollaborators, SHARED_NAMESPACE};
use crate::context::{OverrideNamespace, ResolutionContext};
use crate::driver::{
    AuthDriver, CacheDriver, ConfDriver, DriverCategory, DriverHandle, DriverOverrides,
};
use crate::error::{Error, Result};
use crate::registry::{PluginCatalog, PluginRegistry};
use crate::settings::{GlobalSettings, RequestEnvironment, SettingsDefaults, DEFAULT_ENV_PREFIX};
use crate::substitution::{PlaceholderSubstitution, VariableSubstitution};
use crate::value::{ConfigMap, Value};

/// Plugin id of the boot-time configuration storage
pub const BOOT_CONF_PLUGIN: &str = "boot.conf";

/// Lifecycle of a [`ConfService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Started,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Started => "started",
        })
    }
}

/// Options for building a service
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Prefix of the environment variables holding settings defaults
    pub env_prefix: String,
    /// Core plugin read by the `get_*_config` shorthands
    pub default_core_type: String,
    /// Cache namespace dropped by [`ConfService::clear_all_caches`]
    pub shared_cache_namespace: String,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            default_core_type: "ajaxplorer".to_string(),
            shared_cache_namespace: SHARED_NAMESPACE.to_string(),
        }
    }
}

/// Builder for [`ConfService`]
#[derive(Default)]
pub struct ConfServiceBuilder {
    registry: Option<Arc<dyn PluginRegistry>>,
    substitution: Option<Arc<dyn VariableSubstitution>>,
    defaults: Option<SettingsDefaults>,
    collaborators: CacheCollaborators,
    options: ServiceOptions,
}

impl ConfServiceBuilder {
    /// Plugin registry (defaults to an empty [`PluginCatalog`] with built-in factories)
    pub fn registry(mut self, registry: Arc<dyn PluginRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Substitution engine (defaults to [`PlaceholderSubstitution`] over the service settings)
    pub fn substitution(mut self, substitution: Arc<dyn VariableSubstitution>) -> Self {
        self.substitution = Some(substitution);
        self
    }

    /// Settings defaults (defaults to reading the environment with the options' prefix)
    pub fn defaults(mut self, defaults: SettingsDefaults) -> Self {
        self.defaults = Some(defaults);
        self
    }

    pub fn collaborators(mut self, collaborators: CacheCollaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> ConfService {
        let defaults = self
            .defaults
            .unwrap_or_else(|| SettingsDefaults::from_env(&self.options.env_prefix));
        let settings = Arc::new(GlobalSettings::new(defaults));
        let substitution = self.substitution.unwrap_or_else(|| {
            Arc::new(PlaceholderSubstitution::with_builtins(Arc::clone(&settings)))
        });
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(PluginCatalog::with_builtins()));

        ConfService {
            registry,
            substitution,
            settings,
            collaborators: self.collaborators,
            options: self.options,
            overrides: None,
            state: LifecycleState::Uninitialized,
            errors: Mutex::new(Vec::new()),
        }
    }
}

/// Process-wide configuration resolution service
pub struct ConfService {
    registry: Arc<dyn PluginRegistry>,
    substitution: Arc<dyn VariableSubstitution>,
    settings: Arc<GlobalSettings>,
    collaborators: CacheCollaborators,
    options: ServiceOptions,
    overrides: Option<DriverOverrides>,
    state: LifecycleState,
    errors: Mutex<Vec<Error>>,
}

impl ConfService {
    pub fn builder() -> ConfServiceBuilder {
        ConfServiceBuilder::default()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<dyn PluginRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &Arc<GlobalSettings> {
        &self.settings
    }

    // Lifecycle

    /// Populate the boot settings from the request environment.
    ///
    /// Calling it again overwrites the same keys.
    pub fn init(&mut self, env: &RequestEnvironment) {
        if env.is_https() {
            self.settings.set("USE_HTTPS", true);
        }
        let defaults = self.settings.defaults();
        let (client_debug, server_debug) = (defaults.client_debug, defaults.server_debug);
        self.settings.set("JS_DEBUG", client_debug);
        self.settings.set("SERVER_DEBUG", server_debug);

        if self.state == LifecycleState::Uninitialized {
            self.state = LifecycleState::Initialized;
        }
        log::debug!("Configuration service initialized (https: {})", env.is_https());
    }

    /// Activate the conf driver and run its post-load setup
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Uninitialized => {
                return Err(Error::lifecycle(
                    LifecycleState::Initialized,
                    LifecycleState::Uninitialized,
                ))
            }
            LifecycleState::Started => {
                log::debug!("Configuration service already started");
                return Ok(());
            }
            LifecycleState::Initialized => {}
        }

        let conf = match self.conf_driver().and_then(|conf| {
            self.registry
                .set_plugin_unique_active_for_type(DriverCategory::Conf.as_str(), conf.name())?;
            Ok(conf)
        }) {
            Ok(conf) => conf,
            Err(e) => {
                log::error!("Failed to start configuration service: {}", e);
                self.record_error(e.clone());
                return Err(e);
            }
        };

        if let Err(e) = conf.load_extension() {
            let plugin = format!("{}.{}", DriverCategory::Conf, conf.name());
            let err = Error::plugin_instantiation(plugin, e.to_string());
            log::warn!("Conf driver post-load setup failed: {}", err);
            self.record_error(err);
        }

        self.state = LifecycleState::Started;
        log::debug!("Configuration service started with conf driver '{}'", conf.name());
        Ok(())
    }

    /// Errors accumulated while booting
    pub fn errors(&self) -> Vec<Error> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_error(&self, error: Error) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    // Global settings

    /// Value of a global setting, falling back to its startup default
    pub fn get_conf(&self, key: &str) -> Option<Value> {
        self.settings.get(key)
    }

    pub fn set_conf(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.settings.set(key, value);
    }

    // Drivers

    /// Install conf, auth and cache drivers that bypass the registry
    pub fn set_overrides(&mut self, overrides: DriverOverrides) {
        log::debug!("Installing driver overrides {:?}", overrides);
        self.overrides = Some(overrides);
    }

    pub fn clear_overrides(&mut self) {
        if self.overrides.take().is_some() {
            log::debug!("Cleared driver overrides");
        }
    }

    pub fn overrides(&self) -> Option<&DriverOverrides> {
        self.overrides.as_ref()
    }

    /// Driver of the plugin active for `category` in the registry
    pub fn resolve_driver(
        &self,
        category: DriverCategory,
        ctx: &ResolutionContext,
    ) -> Result<DriverHandle> {
        self.registry.driver(category, ctx)
    }

    /// Active driver of a category: the override if installed, else the registry's
    pub fn get_active_driver(&self, category: DriverCategory) -> Result<DriverHandle> {
        match &self.overrides {
            Some(overrides) => Ok(overrides.handle(category)),
            None => self.resolve_driver(category, &ResolutionContext::empty()),
        }
    }

    pub fn conf_driver(&self) -> Result<Arc<dyn ConfDriver>> {
        let handle = self.get_active_driver(DriverCategory::Conf)?;
        handle
            .as_conf()
            .ok_or_else(|| Error::driver_mismatch(handle.name(), DriverCategory::Conf))
    }

    pub fn auth_driver(&self) -> Result<Arc<dyn AuthDriver>> {
        let handle = self.get_active_driver(DriverCategory::Auth)?;
        handle
            .as_auth()
            .ok_or_else(|| Error::driver_mismatch(handle.name(), DriverCategory::Auth))
    }

    /// Active cache driver, or `None` when caching is disabled
    pub fn cache_driver(&self) -> Option<Arc<dyn CacheDriver>> {
        match self.get_active_driver(DriverCategory::Cache) {
            Ok(handle) => handle.as_cache(),
            Err(e) if e.is_driver_not_found() => None,
            Err(e) => {
                log::warn!("Cache driver unavailable, caching disabled: {}", e);
                None
            }
        }
    }

    /// Usage summary of the active auth driver
    pub fn info(&self) -> Result<String> {
        Ok(self.auth_driver()?.stats())
    }

    /// Whether actions may be handed to a command-line worker.
    ///
    /// Reads `CMDLINE_ACTIVE` from the default core plugin, then from the
    /// global settings.
    pub fn background_actions_supported(&self) -> bool {
        self.get_global_config("CMDLINE_ACTIVE")
            .or_else(|| self.get_conf("CMDLINE_ACTIVE"))
            .is_some_and(|v| v.is_truthy())
    }

    /// Boot-time conf storage, soft-loaded when not declared.
    ///
    /// Failures are recorded in [`ConfService::errors`].
    pub fn boot_conf_driver(&self) -> Option<Arc<dyn ConfDriver>> {
        let ctx = ResolutionContext::empty();
        let handle = match self.registry.plugin_by_id(BOOT_CONF_PLUGIN, &ctx) {
            Some(_) => self.registry.instance(BOOT_CONF_PLUGIN, &ctx),
            None => self.registry.soft_load(BOOT_CONF_PLUGIN, &ConfigMap::new()),
        };

        let driver = handle.and_then(|handle| {
            handle
                .as_conf()
                .ok_or_else(|| Error::driver_mismatch(BOOT_CONF_PLUGIN, DriverCategory::Conf))
        });
        match driver {
            Ok(driver) => Some(driver),
            Err(e) => {
                log::error!("Failed to load boot conf driver: {}", e);
                self.record_error(e);
                None
            }
        }
    }

    /// Build a plugin from configuration parameters.
    ///
    /// `params` is either a plugin id or a mapping naming the plugin under
    /// `instance_name` (or `group_switch_value`); the other entries are
    /// passed to the plugin. Returns `None` when no plugin is named or when
    /// the plugin is not of the `expected` category.
    pub fn instantiate_plugin(
        &self,
        params: &Value,
        expected: Option<DriverCategory>,
    ) -> Result<Option<DriverHandle>> {
        let mut params = match params {
            Value::Null => return Ok(None),
            Value::String(id) => {
                let mut map = ConfigMap::new();
                map.insert("instance_name".into(), Value::String(id.clone()));
                map
            }
            Value::Mapping(map) => map.clone(),
            other => {
                return Err(Error::parse(format!(
                    "Plugin parameters must be a string or a mapping, got {}",
                    other.type_name()
                )))
            }
        };

        if !params.contains_key("instance_name") {
            if let Some(switch) = params.get("group_switch_value").cloned() {
                params.insert("instance_name".into(), switch);
            }
        }

        let Some(instance) = params.shift_remove("instance_name") else {
            return Ok(None);
        };
        let id = instance.as_str().ok_or_else(|| {
            Error::parse(format!(
                "instance_name must be a string, got {}",
                instance.type_name()
            ))
        })?;

        let handle = self.registry.soft_load(id, &params)?;
        handle.perform_checks().map_err(|e| e.with_plugin(id))?;

        match expected {
            Some(expected) if handle.category() != expected => {
                log::debug!(
                    "Plugin '{}' is a {} driver, not a {} driver",
                    id,
                    handle.category(),
                    expected
                );
                Ok(None)
            }
            _ => Ok(Some(handle)),
        }
    }

    // Configuration values

    /// Value of `key` in the default core plugin, under the empty context
    pub fn get_global_config(&self, key: &str) -> Option<Value> {
        self.get_global_config_in(&self.options.default_core_type, key)
    }

    /// Value of `key` in core plugin `core_type`, under the empty context
    pub fn get_global_config_in(&self, core_type: &str, key: &str) -> Option<Value> {
        self.get_context_config_in(&ResolutionContext::empty(), core_type, key)
    }

    /// Value of `key` in the default core plugin, under `ctx`
    pub fn get_context_config(&self, ctx: &ResolutionContext, key: &str) -> Option<Value> {
        self.get_context_config_in(ctx, &self.options.default_core_type, key)
    }

    /// Value of `key` in core plugin `core_type`, under `ctx`.
    ///
    /// The plugin's declared configs go through the principal's merged role
    /// (if any), then the value goes through variable substitution.
    pub fn get_context_config_in(
        &self,
        ctx: &ResolutionContext,
        core_type: &str,
        key: &str,
    ) -> Option<Value> {
        let plugin = self.registry.plugin_by_type_name("core", core_type, ctx)?;
        let mut configs = plugin.configs().clone();

        if let Some(principal) = ctx.principal() {
            let namespace = OverrideNamespace::core(core_type);
            configs = principal.merged_role().filter_plugin_configs(
                &namespace,
                configs,
                ctx.repository_id(),
            );
        }

        let value = configs.get(key)?;
        Some(self.substitution.substitute(value, ctx))
    }

    // Caches

    /// Clear the plugin, locale, shared data and bytecode caches.
    ///
    /// Every step runs even when an earlier one fails; the failures are
    /// returned.
    pub fn clear_all_caches(&self) -> Vec<Error> {
        let mut failures = Vec::new();
        let mut step = |target: &str, result: Result<()>| {
            if let Err(e) = result {
                let err = Error::cache(target, e.cause.clone().unwrap_or_else(|| e.kind.to_string()));
                log::warn!("{}", err);
                failures.push(err);
            }
        };

        step("plugin cache", self.registry.clear_cache());
        if let Some(locale) = &self.collaborators.locale {
            step("locale messages cache", locale.clear_messages_cache());
        }
        if let Some(cache) = self.cache_driver() {
            step(
                "shared data cache",
                cache.delete_all(&self.options.shared_cache_namespace),
            );
        }
        if let Some(bytecode) = &self.collaborators.bytecode {
            step("bytecode cache", bytecode.reset());
        }

        log::debug!("Cleared all caches ({} failures)", failures.len());
        failures
    }

    /// Drop cached user repositories, then the registry lookups.
    ///
    /// Registry lookups are dropped even when the user cache fails.
    pub fn invalidate_repository_caches(&self) -> Result<()> {
        let users = match &self.collaborators.users {
            Some(users) => users.invalidate().map_err(|e| {
                Error::cache("user cache", e.cause.clone().unwrap_or_else(|| e.kind.to_string()))
            }),
            None => Ok(()),
        };
        self.registry.clear_registry_caches();
        users
    }
}

impl fmt::Debug for ConfService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfService")
            .field("state", &self.state)
            .field("options", &self.options)
            .field("overrides", &self.overrides)
            .field("collaborators", &self.collaborators)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BytecodeCache, LocaleService, UserCache};
    use crate::context::Principal;
    use crate::driver::{
        Driver, MemoryAuthDriver, MemoryCacheDriver, MemoryConfDriver,
    };
    use crate::error::ErrorKind;
    use crate::registry::PluginSpec;
    use crate::role::Role;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn catalog() -> Arc<PluginCatalog> {
        let catalog = PluginCatalog::with_builtins();
        catalog.add_plugin(PluginSpec::new("conf", "memory").active());
        catalog.add_plugin(PluginSpec::new("auth", "memory").with_param("users", vec!["alice"]));
        catalog.add_plugin(PluginSpec::new("cache", "memory"));
        catalog.add_plugin(
            PluginSpec::new("core", "ajaxplorer")
                .with_config("MAX_UPLOAD_SIZE", "1GB")
                .with_config("HOME_DIR", "/home/${user}"),
        );
        Arc::new(catalog)
    }

    fn service_with(catalog: Arc<PluginCatalog>) -> ConfService {
        ConfService::builder()
            .registry(catalog)
            .defaults(SettingsDefaults::default())
            .build()
    }

    fn overrides(conf: MemoryConfDriver, cache: Arc<MemoryCacheDriver>) -> DriverOverrides {
        DriverOverrides::new(
            Arc::new(conf),
            Arc::new(MemoryAuthDriver::new("tmp-auth", vec![])),
            cache,
        )
    }

    fn alice(role: Role) -> Principal {
        Principal::new("alice", Arc::new(role))
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Counter {
        fn hit(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct FailingLocale;

    impl LocaleService for FailingLocale {
        fn clear_messages_cache(&self) -> Result<()> {
            Err(Error::internal("messages directory is read-only"))
        }
    }

    impl UserCache for Counter {
        fn invalidate(&self) -> Result<()> {
            self.hit();
            Ok(())
        }
    }

    impl BytecodeCache for Counter {
        fn reset(&self) -> Result<()> {
            self.hit();
            Ok(())
        }
    }

    struct StrictCache;

    impl Driver for StrictCache {
        fn name(&self) -> &str {
            "strict"
        }

        fn perform_checks(&self) -> Result<()> {
            Err(Error::plugin_instantiation("cache.strict", "missing DSN"))
        }
    }

    impl CacheDriver for StrictCache {
        fn fetch(&self, _namespace: &str, _key: &str) -> Option<Value> {
            None
        }

        fn save(&self, _namespace: &str, _key: &str, _value: Value) -> Result<()> {
            Ok(())
        }

        fn delete_all(&self, _namespace: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_service_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConfService>();
    }

    #[test]
    fn test_override_wins_over_registry() {
        let mut service = service_with(Arc::new(PluginCatalog::new()));
        assert!(service
            .get_active_driver(DriverCategory::Conf)
            .unwrap_err()
            .is_driver_not_found());

        let cache = Arc::new(MemoryCacheDriver::new("tmp-cache"));
        service.set_overrides(overrides(MemoryConfDriver::new("tmp-conf"), cache));

        assert_eq!(service.conf_driver().unwrap().name(), "tmp-conf");
        assert_eq!(service.auth_driver().unwrap().name(), "tmp-auth");
        assert_eq!(service.cache_driver().unwrap().name(), "tmp-cache");

        service.clear_overrides();
        assert!(service.overrides().is_none());
        assert!(service.conf_driver().is_err());
        assert!(service.cache_driver().is_none());
    }

    #[test]
    fn test_override_ignores_registry_choice() {
        let mut service = service_with(catalog());
        assert_eq!(service.conf_driver().unwrap().name(), "memory");

        let cache = Arc::new(MemoryCacheDriver::new("tmp-cache"));
        service.set_overrides(overrides(MemoryConfDriver::new("tmp-conf"), cache));
        for category in DriverCategory::ALL {
            assert!(service
                .get_active_driver(category)
                .unwrap()
                .name()
                .starts_with("tmp-"));
        }
    }

    #[test]
    fn test_get_conf_unknown_key() {
        let service = service_with(catalog());
        assert_eq!(service.get_conf("NO_SUCH_SETTING"), None);
    }

    #[test]
    fn test_set_conf_shadows_default() {
        let service = ConfService::builder()
            .registry(catalog())
            .defaults(SettingsDefaults {
                data_path: Some("/var/data".into()),
                ..Default::default()
            })
            .build();

        assert_eq!(service.get_conf("DATA_PATH"), Some(Value::from("/var/data")));
        service.set_conf("DATA_PATH", "/srv/data");
        assert_eq!(service.get_conf("DATA_PATH"), Some(Value::from("/srv/data")));
    }

    #[test]
    fn test_init_populates_boot_settings() {
        let mut service = ConfService::builder()
            .registry(catalog())
            .defaults(SettingsDefaults {
                server_debug: true,
                ..Default::default()
            })
            .build();
        assert_eq!(service.state(), LifecycleState::Uninitialized);

        service.init(&RequestEnvironment::new().with_https("On"));

        assert_eq!(service.state(), LifecycleState::Initialized);
        assert_eq!(service.get_conf("USE_HTTPS"), Some(Value::Bool(true)));
        assert_eq!(service.get_conf("SERVER_DEBUG"), Some(Value::Bool(true)));
        assert_eq!(service.get_conf("JS_DEBUG"), Some(Value::Bool(false)));
    }

    #[test]
    fn test_init_without_https() {
        let mut service = service_with(catalog());
        service.init(&RequestEnvironment::new());
        service.init(&RequestEnvironment::new());

        assert_eq!(service.get_conf("USE_HTTPS"), None);
        assert_eq!(service.state(), LifecycleState::Initialized);
    }

    #[test]
    fn test_start_before_init() {
        let mut service = service_with(catalog());
        let err = service.start().unwrap_err();

        assert_eq!(
            err.kind,
            ErrorKind::Lifecycle {
                expected: LifecycleState::Initialized,
                actual: LifecycleState::Uninitialized,
            }
        );
        assert_eq!(service.state(), LifecycleState::Uninitialized);
    }

    #[test]
    fn test_start_without_conf_driver() {
        let mut service = service_with(Arc::new(PluginCatalog::with_builtins()));
        service.init(&RequestEnvironment::new());

        let err = service.start().unwrap_err();

        assert!(err.is_driver_not_found());
        assert_eq!(service.state(), LifecycleState::Initialized);
        assert_eq!(service.errors().len(), 1);
    }

    #[test]
    fn test_start_activates_conf_driver() {
        let catalog = catalog();
        catalog.add_plugin(PluginSpec::new("conf", "sql"));
        let mut service = service_with(Arc::clone(&catalog));

        let cache = Arc::new(MemoryCacheDriver::new("tmp-cache"));
        service.set_overrides(overrides(MemoryConfDriver::new("sql"), cache));
        service.init(&RequestEnvironment::new());
        service.start().unwrap();

        let ctx = ResolutionContext::empty();
        assert_eq!(service.state(), LifecycleState::Started);
        assert!(catalog.plugin_by_id("conf.sql", &ctx).unwrap().is_active());
        assert!(!catalog.plugin_by_id("conf.memory", &ctx).unwrap().is_active());
        assert!(service.errors().is_empty());

        // Second start is a no-op
        service.start().unwrap();
        assert_eq!(service.state(), LifecycleState::Started);
    }

    #[test]
    fn test_start_records_extension_failure() {
        let mut service = service_with(catalog());
        let conf = MemoryConfDriver::new("memory")
            .with_extension(|| Err(Error::internal("user class file not found")));
        service.set_overrides(overrides(conf, Arc::new(MemoryCacheDriver::new("tmp"))));
        service.init(&RequestEnvironment::new());

        service.start().unwrap();

        let errors = service.errors();
        assert_eq!(service.state(), LifecycleState::Started);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].kind,
            ErrorKind::PluginInstantiation {
                plugin: "conf.memory".into()
            }
        );
    }

    #[test]
    fn test_global_config_lookup() {
        let service = service_with(catalog());

        assert_eq!(service.get_global_config("MAX_UPLOAD_SIZE"), Some(Value::from("1GB")));
        assert_eq!(service.get_global_config("ZIP_CREATION"), None);
        assert_eq!(service.get_global_config_in("mailer", "MAX_UPLOAD_SIZE"), None);
    }

    #[test]
    fn test_role_override_for_repository() {
        let service = service_with(catalog());
        let mut role = Role::new("limited");
        role.set_parameter(OverrideNamespace::core("ajaxplorer"), "repo1", "MAX_UPLOAD_SIZE", "10MB");
        let ctx = ResolutionContext::for_principal(alice(role)).with_repository("repo1");

        assert_eq!(service.get_context_config(&ctx, "MAX_UPLOAD_SIZE"), Some(Value::from("10MB")));
        assert_eq!(service.get_global_config("MAX_UPLOAD_SIZE"), Some(Value::from("1GB")));
    }

    #[test]
    fn test_context_without_overrides_matches_global() {
        let service = service_with(catalog());
        let ctx = ResolutionContext::for_principal(alice(Role::new("plain")))
            .with_repository("repo1");

        assert_eq!(
            service.get_context_config(&ctx, "MAX_UPLOAD_SIZE"),
            service.get_global_config("MAX_UPLOAD_SIZE")
        );
        assert_eq!(service.get_context_config(&ctx, "ZIP_CREATION"), None);
    }

    #[test]
    fn test_role_mask_hides_value() {
        let service = service_with(catalog());
        let mut role = Role::new("masked");
        role.mask_parameter(OverrideNamespace::core("ajaxplorer"), "*", "MAX_UPLOAD_SIZE");
        let ctx = ResolutionContext::for_principal(alice(role));

        assert_eq!(service.get_context_config(&ctx, "MAX_UPLOAD_SIZE"), None);
    }

    #[test]
    fn test_context_value_is_substituted() {
        let service = service_with(catalog());
        let ctx = ResolutionContext::for_principal(alice(Role::new("plain")));

        assert_eq!(service.get_context_config(&ctx, "HOME_DIR"), Some(Value::from("/home/alice")));
        assert_eq!(service.get_global_config("HOME_DIR"), Some(Value::from("/home/${user}")));
    }

    #[test]
    fn test_role_override_is_substituted_after_filtering() {
        let service = service_with(catalog());
        let mut role = Role::new("r");
        role.set_parameter(OverrideNamespace::core("ajaxplorer"), "*", "HOME_DIR", "/data/${user}");
        let ctx = ResolutionContext::for_principal(alice(role));

        assert_eq!(service.get_context_config(&ctx, "HOME_DIR"), Some(Value::from("/data/alice")));
    }

    #[test]
    fn test_clear_all_caches_continues_after_failure() {
        let catalog = catalog();
        let bytecode = Arc::new(Counter::default());
        let mut service = ConfService::builder()
            .registry(Arc::clone(&catalog) as Arc<dyn PluginRegistry>)
            .defaults(SettingsDefaults::default())
            .collaborators(
                CacheCollaborators::new()
                    .with_locale(Arc::new(FailingLocale))
                    .with_bytecode(Arc::clone(&bytecode) as Arc<dyn BytecodeCache>),
            )
            .build();

        let shared = Arc::new(MemoryCacheDriver::new("tmp-cache"));
        shared.save(SHARED_NAMESPACE, "messages", Value::from("cached")).unwrap();
        shared.save("session", "token", Value::from("kept")).unwrap();
        service.set_overrides(overrides(MemoryConfDriver::new("tmp-conf"), Arc::clone(&shared)));

        catalog.driver(DriverCategory::Conf, &ResolutionContext::empty()).unwrap();
        assert!(catalog.is_instantiated("conf.memory"));

        let failures = service.clear_all_caches();

        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].kind,
            ErrorKind::Cache {
                target: "locale messages cache".into()
            }
        );
        assert!(!catalog.is_instantiated("conf.memory"));
        assert!(shared.is_empty(SHARED_NAMESPACE));
        assert_eq!(shared.fetch("session", "token"), Some(Value::from("kept")));
        assert_eq!(bytecode.count(), 1);
    }

    #[test]
    fn test_clear_all_caches_without_cache_driver() {
        let service = service_with(Arc::new(PluginCatalog::with_builtins()));
        assert!(service.cache_driver().is_none());
        assert!(service.clear_all_caches().is_empty());
    }

    #[test]
    fn test_invalidate_repository_caches() {
        let users = Arc::new(Counter::default());
        let service = ConfService::builder()
            .registry(catalog())
            .defaults(SettingsDefaults::default())
            .collaborators(
                CacheCollaborators::new().with_users(Arc::clone(&users) as Arc<dyn UserCache>),
            )
            .build();

        service.invalidate_repository_caches().unwrap();
        assert_eq!(users.count(), 1);
    }

    #[test]
    fn test_info_reports_auth_stats() {
        let service = service_with(catalog());
        assert_eq!(service.info().unwrap(), "memory:1");

        let empty = service_with(Arc::new(PluginCatalog::with_builtins()));
        assert!(empty.info().unwrap_err().is_driver_not_found());
    }

    #[test]
    fn test_background_actions_from_settings_default() {
        let service = ConfService::builder()
            .registry(catalog())
            .defaults(SettingsDefaults {
                cmdline_active: true,
                ..Default::default()
            })
            .build();
        assert!(service.background_actions_supported());

        assert!(!service_with(catalog()).background_actions_supported());
    }

    #[test]
    fn test_background_actions_core_config_wins() {
        let catalog = catalog();
        catalog.add_plugin(
            PluginSpec::new("core", "ajaxplorer").with_config("CMDLINE_ACTIVE", "off"),
        );
        let service = ConfService::builder()
            .registry(catalog)
            .defaults(SettingsDefaults {
                cmdline_active: true,
                ..Default::default()
            })
            .build();

        assert!(!service.background_actions_supported());
    }

    #[test]
    fn test_boot_conf_driver_soft_loaded() {
        let catalog = catalog();
        let service = service_with(Arc::clone(&catalog));

        let boot = service.boot_conf_driver().unwrap();

        assert_eq!(boot.name(), "conf");
        assert!(!catalog.is_instantiated(BOOT_CONF_PLUGIN));
        assert!(service.errors().is_empty());
    }

    #[test]
    fn test_boot_conf_driver_declared_is_memoized() {
        let catalog = catalog();
        catalog.add_plugin(PluginSpec::new("boot", "conf"));
        let service = service_with(Arc::clone(&catalog));

        assert!(service.boot_conf_driver().is_some());
        assert!(catalog.is_instantiated(BOOT_CONF_PLUGIN));
    }

    #[test]
    fn test_boot_conf_driver_failure_is_recorded() {
        let service = service_with(Arc::new(PluginCatalog::new()));

        assert!(service.boot_conf_driver().is_none());
        let errors = service.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].kind, ErrorKind::PluginInstantiation { .. }));
    }

    #[test]
    fn test_instantiate_plugin_from_id() {
        let service = service_with(catalog());

        let handle = service
            .instantiate_plugin(&Value::from("cache.memory"), Some(DriverCategory::Cache))
            .unwrap()
            .unwrap();
        assert_eq!(handle.category(), DriverCategory::Cache);

        assert!(service.instantiate_plugin(&Value::Null, None).unwrap().is_none());
    }

    #[test]
    fn test_instantiate_plugin_from_group_switch() {
        let service = service_with(catalog());
        let mut params = ConfigMap::new();
        params.insert("group_switch_value".into(), Value::from("auth.memory"));
        params.insert("users".into(), Value::from(vec!["alice", "bob"]));

        let handle = service
            .instantiate_plugin(&Value::Mapping(params), Some(DriverCategory::Auth))
            .unwrap()
            .unwrap();
        assert_eq!(handle.as_auth().unwrap().stats(), "memory:2");
    }

    #[test]
    fn test_instantiate_plugin_wrong_category() {
        let service = service_with(catalog());
        let result = service
            .instantiate_plugin(&Value::from("cache.memory"), Some(DriverCategory::Conf))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_instantiate_plugin_runs_checks() {
        let mut catalog = PluginCatalog::with_builtins();
        catalog.register_fn("cache.strict", |_, _| Ok(DriverHandle::Cache(Arc::new(StrictCache))));
        let service = service_with(Arc::new(catalog));

        let err = service
            .instantiate_plugin(&Value::from("cache.strict"), None)
            .unwrap_err();
        assert_eq!(err.cause.as_deref(), Some("missing DSN"));
    }

    #[test]
    fn test_instantiate_plugin_rejects_bad_params() {
        let service = service_with(catalog());
        assert!(service.instantiate_plugin(&Value::Integer(3), None).is_err());

        let mut params = ConfigMap::new();
        params.insert("instance_name".into(), Value::Bool(true));
        assert!(service.instantiate_plugin(&Value::Mapping(params), None).is_err());
    }
}

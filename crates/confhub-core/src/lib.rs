//! confhub-core: Configuration resolution service
//!
//! This crate selects the active configuration storage, authentication and
//! cache drivers at runtime, and resolves configuration values by merging
//! plugin-declared defaults with the role overrides of a request context
//! and expanding the variables they contain.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use confhub_core::{
//!     ConfService, OverrideNamespace, PluginCatalog, PluginSpec, Principal,
//!     RequestEnvironment, ResolutionContext, Role, SettingsDefaults, Value,
//! };
//!
//! let catalog = PluginCatalog::with_builtins();
//! catalog.add_plugin(PluginSpec::new("conf", "memory").active());
//! catalog.add_plugin(PluginSpec::new("core", "ajaxplorer").with_config("MAX_UPLOAD_SIZE", "1GB"));
//!
//! let mut service = ConfService::builder()
//!     .registry(Arc::new(catalog))
//!     .defaults(SettingsDefaults::default())
//!     .build();
//! service.init(&RequestEnvironment::new());
//! service.start().unwrap();
//!
//! let mut role = Role::new("limited");
//! role.set_parameter(OverrideNamespace::core("ajaxplorer"), "repo1", "MAX_UPLOAD_SIZE", "10MB");
//! let ctx = ResolutionContext::for_principal(Principal::new("alice", Arc::new(role)))
//!     .with_repository("repo1");
//!
//! assert_eq!(service.get_context_config(&ctx, "MAX_UPLOAD_SIZE"), Some(Value::from("10MB")));
//! assert_eq!(service.get_global_config("MAX_UPLOAD_SIZE"), Some(Value::from("1GB")));
//! ```

pub mod cache;
pub mod context;
pub mod driver;
pub mod error;
pub mod registry;
pub mod role;
pub mod schema;
pub mod settings;
pub mod substitution;
pub mod value;

mod service;

pub use cache::{BytecodeCache, CacheCollaborators, LocaleService, UserCache, SHARED_NAMESPACE};
pub use context::{MergedRole, OverrideNamespace, Principal, ResolutionContext};
pub use driver::{
    AuthDriver, CacheDriver, ConfDriver, Driver, DriverCategory, DriverHandle, DriverOverrides,
    MemoryAuthDriver, MemoryCacheDriver, MemoryConfDriver,
};
pub use error::{Error, ErrorKind, Result};
pub use registry::{Plugin, PluginCatalog, PluginManifest, PluginRegistry, PluginSpec};
pub use role::{Role, RoleBook};
pub use service::{
    ConfService, ConfServiceBuilder, LifecycleState, ServiceOptions, BOOT_CONF_PLUGIN,
};
pub use settings::{GlobalSettings, RequestEnvironment, SettingsDefaults};
pub use substitution::{PlaceholderSubstitution, VariableSubstitution};
pub use value::{ConfigMap, Value};

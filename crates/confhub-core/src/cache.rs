//! Cache collaborators
//!
//! Caches outside the plugin registry that the service clears as part of
//! its invalidation cascades. Each one is optional; a missing collaborator
//! is skipped.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Namespace of the data cache shared by all users
pub const SHARED_NAMESPACE: &str = "shared";

/// Translated message catalogs
pub trait LocaleService: Send + Sync {
    fn clear_messages_cache(&self) -> Result<()>;
}

/// Per-user repository and permission cache
pub trait UserCache: Send + Sync {
    fn invalidate(&self) -> Result<()>;
}

/// Compiled code cache of the host runtime
pub trait BytecodeCache: Send + Sync {
    fn reset(&self) -> Result<()>;
}

/// The optional cache collaborators of a service
#[derive(Clone, Default)]
pub struct CacheCollaborators {
    pub locale: Option<Arc<dyn LocaleService>>,
    pub users: Option<Arc<dyn UserCache>>,
    pub bytecode: Option<Arc<dyn BytecodeCache>>,
}

impl CacheCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_locale(mut self, locale: Arc<dyn LocaleService>) -> Self {
        self.locale = Some(locale);
        self
    }

    pub fn with_users(mut self, users: Arc<dyn UserCache>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn with_bytecode(mut self, bytecode: Arc<dyn BytecodeCache>) -> Self {
        self.bytecode = Some(bytecode);
        self
    }
}

impl fmt::Debug for CacheCollaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCollaborators")
            .field("locale", &self.locale.is_some())
            .field("users", &self.users.is_some())
            .field("bytecode", &self.bytecode.is_some())
            .finish()
    }
}

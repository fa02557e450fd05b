//! Resolution context
//!
//! A context is the (principal, repository) pair under which a
//! configuration value is resolved. A context without a principal is the
//! empty context used for global, non-personalized lookups.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::value::ConfigMap;

/// Namespace under which role overrides of a plugin's configuration are filed.
///
/// Kept as a separated `(category, name)` pair and rendered `category.name`,
/// so `("core", "xajaxplorer")` and `("corex", "ajaxplorer")` stay distinct.
/// The category never contains a dot, which keeps the rendered form
/// unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OverrideNamespace {
    category: String,
    name: String,
}

impl OverrideNamespace {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Result<Self, Error> {
        let category = category.into();
        let name = name.into();
        if category.is_empty() || name.is_empty() || category.contains('.') {
            return Err(Error::parse(format!(
                "Invalid override namespace ('{}', '{}')",
                category, name
            ))
            .with_help("The category must be non-empty and contain no '.'; the name must be non-empty"));
        }
        Ok(Self { category, name })
    }

    /// Namespace of a `core` plugin
    pub fn core(name: impl Into<String>) -> Self {
        Self {
            category: "core".to_string(),
            name: name.into(),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for OverrideNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.category, self.name)
    }
}

impl TryFrom<String> for OverrideNamespace {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.split_once('.') {
            Some((category, name)) => Self::new(category, name),
            None => Err(Error::parse(format!(
                "Invalid override namespace '{}', expected 'category.name'",
                s
            ))),
        }
    }
}

impl From<OverrideNamespace> for String {
    fn from(ns: OverrideNamespace) -> Self {
        ns.to_string()
    }
}

/// The merged role of a principal, as supplied by the role model
pub trait MergedRole: Send + Sync {
    /// Apply this role's overrides to a plugin's declared configuration.
    ///
    /// Overrides may replace values, mask keys, or leave the map untouched.
    fn filter_plugin_configs(
        &self,
        namespace: &OverrideNamespace,
        configs: ConfigMap,
        repository_id: Option<&str>,
    ) -> ConfigMap;
}

/// An authenticated user
#[derive(Clone)]
pub struct Principal {
    id: String,
    group_path: Option<String>,
    role: Arc<dyn MergedRole>,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Arc<dyn MergedRole>) -> Self {
        Self {
            id: id.into(),
            group_path: None,
            role,
        }
    }

    pub fn with_group_path(mut self, group_path: impl Into<String>) -> Self {
        self.group_path = Some(group_path.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group_path(&self) -> Option<&str> {
        self.group_path.as_deref()
    }

    /// Merged role of all roles applicable to this principal
    pub fn merged_role(&self) -> &dyn MergedRole {
        self.role.as_ref()
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("id", &self.id)
            .field("group_path", &self.group_path)
            .finish_non_exhaustive()
    }
}

/// The (principal, repository) pair a value is resolved under
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    principal: Option<Principal>,
    repository_id: Option<String>,
}

impl ResolutionContext {
    /// The empty context: no principal, no repository
    pub fn empty() -> Self {
        Self::default()
    }

    /// Context for a principal, without a target repository
    pub fn for_principal(principal: Principal) -> Self {
        Self {
            principal: Some(principal),
            repository_id: None,
        }
    }

    /// Set the target repository
    pub fn with_repository(mut self, repository_id: impl Into<String>) -> Self {
        self.repository_id = Some(repository_id.into());
        self
    }

    pub fn has_principal(&self) -> bool {
        self.principal.is_some()
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn repository_id(&self) -> Option<&str> {
        self.repository_id.as_deref()
    }

    /// Whether this is the empty context
    pub fn is_empty(&self) -> bool {
        self.principal.is_none() && self.repository_id.is_none()
    }
}

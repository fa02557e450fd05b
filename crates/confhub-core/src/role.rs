//! Role model
//!
//! A role carries configuration overrides per plugin namespace, each
//! scoped either to one repository or to all of them. A principal's roles
//! are merged in order (later roles win) into a single [`Role`] that acts
//! as the principal's [`MergedRole`].

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::context::{MergedRole, OverrideNamespace};
use crate::error::{Error, Result};
use crate::value::{merge_maps, ConfigMap, Value};

/// Scope key matching every repository
pub const ALL_REPOSITORIES: &str = "*";

/// A set of configuration overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    /// namespace -> scope (repository id or `*`) -> overrides
    #[serde(default)]
    pub parameters: IndexMap<OverrideNamespace, IndexMap<String, ConfigMap>>,
}

impl Role {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parameters: IndexMap::new(),
        }
    }

    /// Override `key` in `namespace` for one repository scope
    pub fn set_parameter(
        &mut self,
        namespace: OverrideNamespace,
        scope: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) {
        self.parameters
            .entry(namespace)
            .or_default()
            .entry(scope.into())
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Hide `key` in `namespace` for one repository scope
    pub fn mask_parameter(
        &mut self,
        namespace: OverrideNamespace,
        scope: impl Into<String>,
        key: impl Into<String>,
    ) {
        self.set_parameter(namespace, scope, key, Value::Null);
    }

    /// Merge roles in order into one role; later roles win per key.
    ///
    /// Masks are kept as null entries so they still apply after merging.
    pub fn merge_all<I>(id: impl Into<String>, roles: I) -> Role
    where
        I: IntoIterator<Item = Role>,
    {
        let mut merged = Role::new(id);
        for role in roles {
            for (namespace, scopes) in role.parameters {
                let target = merged.parameters.entry(namespace).or_default();
                for (scope, overrides) in scopes {
                    target.entry(scope).or_default().extend(overrides);
                }
            }
        }
        merged
    }
}

impl MergedRole for Role {
    fn filter_plugin_configs(
        &self,
        namespace: &OverrideNamespace,
        mut configs: ConfigMap,
        repository_id: Option<&str>,
    ) -> ConfigMap {
        let Some(scopes) = self.parameters.get(namespace) else {
            return configs;
        };

        if let Some(overrides) = scopes.get(ALL_REPOSITORIES) {
            merge_maps(&mut configs, overrides.clone());
        }
        if let Some(overrides) = repository_id
            .filter(|repo| *repo != ALL_REPOSITORIES)
            .and_then(|repo| scopes.get(repo))
        {
            merge_maps(&mut configs, overrides.clone());
        }

        configs
    }
}

/// Role definitions plus the roles assigned to each user.
///
/// ```yaml
/// roles:
///   - id: limited
///     parameters:
///       core.ajaxplorer:
///         repo1:
///           MAX_UPLOAD_SIZE: 10MB
/// users:
///   alice: [limited]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleBook {
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub users: IndexMap<String, Vec<String>>,
}

impl RoleBook {
    /// Load a role book from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::parse(format!("Invalid role book: {}", e)))
    }

    /// Load a role book from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::parse(format!("Failed to read file '{}': {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Merged role of a user, following the order of its role list.
    ///
    /// Unknown role ids are skipped with a warning.
    pub fn merged_for(&self, user_id: &str) -> Role {
        let assigned = self.users.get(user_id).map(Vec::as_slice).unwrap_or(&[]);
        let roles = assigned.iter().filter_map(|role_id| {
            let role = self.roles.iter().find(|r| &r.id == role_id);
            if role.is_none() {
                log::warn!("User '{}' references unknown role '{}'", user_id, role_id);
            }
            role.cloned()
        });
        Role::merge_all(format!("merged:{}", user_id), roles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn defaults() -> ConfigMap {
        let mut configs = ConfigMap::new();
        configs.insert("MAX_UPLOAD_SIZE".into(), Value::from("1GB"));
        configs.insert("ZIP_CREATION".into(), Value::Bool(true));
        configs
    }

    #[test]
    fn test_repository_scope_override() {
        let mut role = Role::new("limited");
        role.set_parameter(OverrideNamespace::core("ajaxplorer"), "repo1", "MAX_UPLOAD_SIZE", "10MB");

        let ns = OverrideNamespace::core("ajaxplorer");
        let filtered = role.filter_plugin_configs(&ns, defaults(), Some("repo1"));
        assert_eq!(filtered["MAX_UPLOAD_SIZE"], Value::from("10MB"));

        let other_repo = role.filter_plugin_configs(&ns, defaults(), Some("repo2"));
        assert_eq!(other_repo["MAX_UPLOAD_SIZE"], Value::from("1GB"));
    }

    #[test]
    fn test_repository_scope_wins_over_all_scope() {
        let ns = OverrideNamespace::core("ajaxplorer");
        let mut role = Role::new("r");
        role.set_parameter(ns.clone(), ALL_REPOSITORIES, "MAX_UPLOAD_SIZE", "100MB");
        role.set_parameter(ns.clone(), "repo1", "MAX_UPLOAD_SIZE", "10MB");

        let repo1 = role.filter_plugin_configs(&ns, defaults(), Some("repo1"));
        assert_eq!(repo1["MAX_UPLOAD_SIZE"], Value::from("10MB"));

        let no_repo = role.filter_plugin_configs(&ns, defaults(), None);
        assert_eq!(no_repo["MAX_UPLOAD_SIZE"], Value::from("100MB"));
    }

    #[test]
    fn test_mask_removes_key() {
        let ns = OverrideNamespace::core("ajaxplorer");
        let mut role = Role::new("r");
        role.mask_parameter(ns.clone(), ALL_REPOSITORIES, "ZIP_CREATION");

        let filtered = role.filter_plugin_configs(&ns, defaults(), Some("repo1"));
        assert!(!filtered.contains_key("ZIP_CREATION"));
        assert!(filtered.contains_key("MAX_UPLOAD_SIZE"));
    }

    #[test]
    fn test_other_namespace_untouched() {
        let mut role = Role::new("r");
        role.set_parameter(OverrideNamespace::core("mailer"), ALL_REPOSITORIES, "MAX_UPLOAD_SIZE", "1KB");

        let filtered =
            role.filter_plugin_configs(&OverrideNamespace::core("ajaxplorer"), defaults(), None);
        assert_eq!(filtered, defaults());
    }

    #[test]
    fn test_merge_all_later_role_wins_and_keeps_masks() {
        let ns = OverrideNamespace::core("ajaxplorer");
        let mut root = Role::new("root");
        root.set_parameter(ns.clone(), ALL_REPOSITORIES, "MAX_UPLOAD_SIZE", "500MB");
        let mut user = Role::new("user");
        user.set_parameter(ns.clone(), ALL_REPOSITORIES, "MAX_UPLOAD_SIZE", "20MB");
        user.mask_parameter(ns.clone(), ALL_REPOSITORIES, "ZIP_CREATION");

        let merged = Role::merge_all("merged", vec![root, user]);
        let filtered = merged.filter_plugin_configs(&ns, defaults(), None);

        assert_eq!(filtered["MAX_UPLOAD_SIZE"], Value::from("20MB"));
        assert!(!filtered.contains_key("ZIP_CREATION"));
    }

    #[test]
    fn test_role_book_from_yaml() {
        let yaml = r#"
roles:
  - id: root
    parameters:
      core.ajaxplorer:
        "*":
          MAX_UPLOAD_SIZE: 500MB
  - id: limited
    parameters:
      core.ajaxplorer:
        repo1:
          MAX_UPLOAD_SIZE: 10MB
users:
  alice: [root, limited, ghost]
"#;
        let book = RoleBook::from_yaml(yaml).unwrap();
        let ns = OverrideNamespace::core("ajaxplorer");

        let alice = book.merged_for("alice");
        assert_eq!(
            alice.filter_plugin_configs(&ns, defaults(), Some("repo1"))["MAX_UPLOAD_SIZE"],
            Value::from("10MB")
        );
        assert_eq!(
            alice.filter_plugin_configs(&ns, defaults(), Some("repo2"))["MAX_UPLOAD_SIZE"],
            Value::from("500MB")
        );

        let bob = book.merged_for("bob");
        assert_eq!(bob.filter_plugin_configs(&ns, defaults(), Some("repo1")), defaults());
    }

    #[test]
    fn test_role_book_rejects_bad_namespace() {
        let yaml = r#"
roles:
  - id: broken
    parameters:
      coreajaxplorer:
        "*":
          A: b
"#;
        assert!(RoleBook::from_yaml(yaml).is_err());
    }
}

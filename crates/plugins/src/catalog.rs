//! Immutable catalog snapshots

use crate::error::{RegistryError, Result};
use crate::manifest::{ActionSpec, PluginManifest};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Visibility tier of a plugin or caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    System,
    User(String),
}

impl Scope {
    pub fn user(id: impl Into<String>) -> Self {
        Scope::User(id.into())
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Scope::System)
    }

    /// The user identity, if any
    pub fn owner(&self) -> Option<&str> {
        match self {
            Scope::System => None,
            Scope::User(id) => Some(id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::System => f.write_str("system"),
            Scope::User(id) => write!(f, "user:{}", id),
        }
    }
}

/// One published version of every loaded plugin.
///
/// Never mutated after publication; writers derive a new catalog and the
/// registry swaps it in whole.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    version: u64,
    system: Vec<Arc<PluginManifest>>,
    users: HashMap<String, Vec<Arc<PluginManifest>>>,
}

impl Catalog {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Plugins loaded directly into `scope`, in insertion order
    pub fn plugins(&self, scope: &Scope) -> &[Arc<PluginManifest>] {
        match scope {
            Scope::System => &self.system,
            Scope::User(id) => self.users.get(id).map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    pub fn plugin(&self, scope: &Scope, id: &str) -> Option<&Arc<PluginManifest>> {
        self.plugins(scope).iter().find(|p| p.id == id)
    }

    /// Users with at least one plugin
    pub fn users(&self) -> impl Iterator<Item = &str> {
        self.users.keys().map(String::as_str)
    }

    fn own_action(&self, scope: &Scope, name: &str) -> Option<&Arc<ActionSpec>> {
        self.plugins(scope)
            .iter()
            .flat_map(|p| p.actions.iter())
            .find(|a| a.name == name)
    }

    /// Look up `name` for a caller: the user's own actions shadow system ones.
    pub fn resolve(&self, scope: &Scope, name: &str) -> Result<Arc<ActionSpec>> {
        if let Scope::User(_) = scope {
            if let Some(action) = self.own_action(scope, name) {
                return Ok(action.clone());
            }
        }
        self.own_action(&Scope::System, name)
            .cloned()
            .ok_or_else(|| RegistryError::ActionNotFound(name.to_string()))
    }

    /// Merged view for a caller.
    ///
    /// System actions come first in insertion order, minus any the user
    /// shadows, followed by the user's actions in insertion order.
    pub fn catalog_for(&self, scope: &Scope) -> Vec<Arc<ActionSpec>> {
        let own: Vec<Arc<ActionSpec>> = match scope {
            Scope::System => Vec::new(),
            Scope::User(_) => self
                .plugins(scope)
                .iter()
                .flat_map(|p| p.actions.iter().cloned())
                .collect(),
        };
        let shadowed: HashSet<&str> = own.iter().map(|a| a.name.as_str()).collect();

        let mut merged: Vec<Arc<ActionSpec>> = self
            .system
            .iter()
            .flat_map(|p| p.actions.iter())
            .filter(|a| !shadowed.contains(a.name.as_str()))
            .cloned()
            .collect();
        merged.extend(own);
        merged
    }

    /// Copy of this catalog with `manifest` added to `scope`, replacing any
    /// plugin with the same id in place.
    pub(crate) fn with_plugin(&self, scope: &Scope, manifest: Arc<PluginManifest>) -> Result<Self> {
        for other in self.plugins(scope).iter().filter(|p| p.id != manifest.id) {
            if let Some(name) = manifest
                .action_names()
                .find(|name| other.action(name).is_some())
            {
                return Err(RegistryError::invalid(
                    &manifest.root,
                    format!(
                        "action '{}' is already provided by plugin '{}' in scope {}",
                        name, other.id, scope
                    ),
                ));
            }
        }

        let mut plugins = self.plugins(scope).to_vec();
        match plugins.iter().position(|p| p.id == manifest.id) {
            Some(index) => plugins[index] = manifest,
            None => plugins.push(manifest),
        }
        Ok(self.with_scope(scope, plugins))
    }

    /// Copy of this catalog without plugin `id`; `None` if it is absent.
    pub(crate) fn without_plugin(&self, scope: &Scope, id: &str) -> Option<(Self, Arc<PluginManifest>)> {
        let mut plugins = self.plugins(scope).to_vec();
        let index = plugins.iter().position(|p| p.id == id)?;
        let removed = plugins.remove(index);
        Some((self.with_scope(scope, plugins), removed))
    }

    /// Copy of this catalog with `scope`'s plugin list replaced
    pub(crate) fn with_scope(&self, scope: &Scope, plugins: Vec<Arc<PluginManifest>>) -> Self {
        let mut next = self.clone();
        match scope {
            Scope::System => next.system = plugins,
            Scope::User(id) => {
                if plugins.is_empty() {
                    next.users.remove(id);
                } else {
                    next.users.insert(id.clone(), plugins);
                }
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ParameterContract;
    use crate::manifest::{ActionKind, Trigger};
    use std::path::PathBuf;
    use std::time::Duration;

    fn manifest(id: &str, actions: &[&str]) -> Arc<PluginManifest> {
        let root = PathBuf::from(format!("/plugins/{}", id));
        Arc::new(PluginManifest {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            root: root.clone(),
            actions: actions
                .iter()
                .map(|name| {
                    Arc::new(ActionSpec {
                        plugin_id: id.to_string(),
                        name: name.to_string(),
                        description: format!("{} from {}", name, id),
                        script: root.join("main.sh"),
                        kind: ActionKind::Process,
                        interpreter: None,
                        parameters: ParameterContract::default(),
                        cache_ttl: Duration::ZERO,
                        trigger: Trigger::Manual,
                        plugin_root: root.clone(),
                        generation: 0,
                    })
                })
                .collect(),
            integrity: None,
        })
    }

    fn names(actions: &[Arc<ActionSpec>]) -> Vec<String> {
        actions.iter().map(|a| a.name.clone()).collect()
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(Scope::System.to_string(), "system");
        assert_eq!(Scope::user("42").to_string(), "user:42");
        assert_eq!(Scope::user("42").owner(), Some("42"));
        assert!(Scope::System.owner().is_none());
    }

    #[test]
    fn test_user_shadows_system() {
        let alice = Scope::user("alice");
        let catalog = Catalog::default()
            .with_plugin(&Scope::System, manifest("sys", &["search", "time"]))
            .unwrap()
            .with_plugin(&alice, manifest("mine", &["search"]))
            .unwrap();

        let resolved = catalog.resolve(&alice, "search").unwrap();
        assert_eq!(resolved.plugin_id, "mine");
        assert_eq!(catalog.resolve(&Scope::System, "search").unwrap().plugin_id, "sys");
        assert_eq!(catalog.resolve(&Scope::user("bob"), "search").unwrap().plugin_id, "sys");

        let merged = catalog.catalog_for(&alice);
        assert_eq!(names(&merged), vec!["time", "search"]);
        assert_eq!(merged[1].plugin_id, "mine");
    }

    #[test]
    fn test_system_scope_ignores_user_plugins() {
        let catalog = Catalog::default()
            .with_plugin(&Scope::user("alice"), manifest("mine", &["private"]))
            .unwrap();

        assert!(catalog.catalog_for(&Scope::System).is_empty());
        assert!(matches!(
            catalog.resolve(&Scope::System, "private"),
            Err(RegistryError::ActionNotFound(_))
        ));
        assert!(catalog.resolve(&Scope::user("bob"), "private").is_err());
    }

    #[test]
    fn test_insertion_order_stable() {
        let catalog = Catalog::default()
            .with_plugin(&Scope::System, manifest("b", &["zeta"]))
            .unwrap()
            .with_plugin(&Scope::System, manifest("a", &["alpha", "beta"]))
            .unwrap();
        assert_eq!(
            names(&catalog.catalog_for(&Scope::System)),
            vec!["zeta", "alpha", "beta"]
        );

        // Replacing a plugin keeps its position
        let catalog = catalog
            .with_plugin(&Scope::System, manifest("b", &["zeta", "eta"]))
            .unwrap();
        assert_eq!(
            names(&catalog.catalog_for(&Scope::System)),
            vec!["zeta", "eta", "alpha", "beta"]
        );
    }

    #[test]
    fn test_collision_within_scope_rejected() {
        let catalog = Catalog::default()
            .with_plugin(&Scope::System, manifest("a", &["search"]))
            .unwrap();
        let err = catalog
            .with_plugin(&Scope::System, manifest("b", &["search"]))
            .unwrap_err();
        assert!(err.to_string().contains("already provided by plugin 'a'"));
    }

    #[test]
    fn test_without_plugin() {
        let alice = Scope::user("alice");
        let catalog = Catalog::default()
            .with_plugin(&alice, manifest("mine", &["x"]))
            .unwrap();

        let (next, removed) = catalog.without_plugin(&alice, "mine").unwrap();
        assert_eq!(removed.id, "mine");
        assert!(next.plugins(&alice).is_empty());
        assert_eq!(next.users().count(), 0);
        assert!(next.without_plugin(&alice, "mine").is_none());
        // The original snapshot is untouched
        assert_eq!(catalog.plugins(&alice).len(), 1);
    }
}

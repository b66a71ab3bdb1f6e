//! Plugin registry
//!
//! Readers take an `Arc<Catalog>` snapshot and never wait on disk work.
//! Writers are serialized, build the next catalog off to the side and
//! publish it with a single pointer swap.

use crate::catalog::{Catalog, Scope};
use crate::error::{RegistryError, Result};
use crate::manifest::{ActionSpec, PluginManifest, MANIFEST_FILE};
use genesis_config::{paths, Config};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A plugin directory skipped during reload
#[derive(Debug, Clone)]
pub struct Rejected {
    pub path: PathBuf,
    pub reason: String,
}

/// What a reload changed
#[derive(Debug, Clone, Default)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub rejected: Vec<Rejected>,
}

impl ReloadReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Authoritative set of installed actions
pub struct PluginRegistry {
    current: RwLock<Arc<Catalog>>,
    writer: Mutex<()>,
    system_dir: PathBuf,
    users_dir: PathBuf,
}

impl PluginRegistry {
    pub fn new(system_dir: impl Into<PathBuf>, users_dir: impl Into<PathBuf>) -> Self {
        Self {
            current: RwLock::new(Arc::new(Catalog::default())),
            writer: Mutex::new(()),
            system_dir: system_dir.into(),
            users_dir: users_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.system_plugins_dir(), config.users_dir())
    }

    /// Directory scanned by `reload(scope)`
    pub fn scope_dir(&self, scope: &Scope) -> PathBuf {
        match scope {
            Scope::System => self.system_dir.clone(),
            Scope::User(id) => paths::user_plugins_dir(&self.users_dir, id),
        }
    }

    /// The current catalog version
    pub fn snapshot(&self) -> Arc<Catalog> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, next: Catalog) -> Arc<Catalog> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = Arc::new(next.with_version(guard.version() + 1));
        *guard = next.clone();
        debug!(version = next.version(), "catalog published");
        next
    }

    pub fn resolve(&self, scope: &Scope, name: &str) -> Result<Arc<ActionSpec>> {
        self.snapshot().resolve(scope, name)
    }

    pub fn catalog_for(&self, scope: &Scope) -> Vec<Arc<ActionSpec>> {
        self.snapshot().catalog_for(scope)
    }

    /// Validate the plugin at `source` and register it in `scope`,
    /// replacing any loaded plugin with the same id.
    pub async fn load(&self, scope: &Scope, source: &Path) -> Result<Arc<PluginManifest>> {
        let manifest = Arc::new(PluginManifest::load(source).await?);

        let _writer = self.writer.lock().await;
        let next = self.snapshot().with_plugin(scope, manifest.clone())?;
        self.publish(next);

        info!(
            plugin_id = %manifest.id,
            version = %manifest.version,
            scope = %scope,
            "plugin loaded"
        );
        Ok(manifest)
    }

    /// Deregister plugin `id` from `scope`. Files on disk are left alone.
    pub async fn remove(&self, scope: &Scope, id: &str) -> Result<Arc<PluginManifest>> {
        let _writer = self.writer.lock().await;
        let (next, removed) = self
            .snapshot()
            .without_plugin(scope, id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        self.publish(next);

        info!(plugin_id = %id, scope = %scope, "plugin removed");
        Ok(removed)
    }

    /// Re-scan the scope's plugin directory and publish the result.
    ///
    /// Invalid plugins are skipped and reported. Plugins that survive keep
    /// their catalog position; new ones are appended in directory-name order.
    pub async fn reload(&self, scope: &Scope) -> Result<ReloadReport> {
        let dir = self.scope_dir(scope);
        let mut report = ReloadReport::default();
        let scanned = scan_dir(&dir, &mut report).await?;

        let _writer = self.writer.lock().await;
        let current = self.snapshot();
        let previous = current.plugins(scope);

        let mut next = current.with_scope(scope, Vec::new());
        let mut accepted: HashSet<String> = HashSet::new();

        // Keep surviving plugins in their old order, then append new ones
        let ordered = previous
            .iter()
            .filter_map(|old| scanned.iter().find(|m| m.id == old.id))
            .chain(
                scanned
                    .iter()
                    .filter(|m| !previous.iter().any(|old| old.id == m.id)),
            );

        for manifest in ordered {
            match next.with_plugin(scope, manifest.clone()) {
                Ok(catalog) => {
                    next = catalog;
                    accepted.insert(manifest.id.clone());
                    if previous.iter().any(|old| old.id == manifest.id) {
                        report.updated.push(manifest.id.clone());
                    } else {
                        report.added.push(manifest.id.clone());
                    }
                }
                Err(e) => {
                    warn!(plugin_id = %manifest.id, error = %e, "plugin rejected");
                    report.rejected.push(Rejected {
                        path: manifest.root.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.removed = previous
            .iter()
            .filter(|old| !accepted.contains(&old.id))
            .map(|old| old.id.clone())
            .collect();

        self.publish(next);
        info!(
            scope = %scope,
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            rejected = report.rejected.len(),
            "plugins reloaded"
        );
        Ok(report)
    }

    /// Reload the system scope and every user directory that exists.
    pub async fn discover(&self) -> Result<Vec<(Scope, ReloadReport)>> {
        let mut scopes = vec![Scope::System];
        if let Ok(mut entries) = tokio::fs::read_dir(&self.users_dir).await {
            let mut users = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                match paths::decode_filename(&name) {
                    Some(user) => users.push(user),
                    None => warn!(dir = %name, "skipping user directory with unencoded name"),
                }
            }
            users.sort();
            scopes.extend(users.into_iter().map(Scope::User));
        }

        let mut reports = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let report = self.reload(&scope).await?;
            reports.push((scope, report));
        }
        Ok(reports)
    }
}

/// Parse every `<dir>/*/manifest.json`, sorted by directory name.
async fn scan_dir(dir: &Path, report: &mut ReloadReport) -> Result<Vec<Arc<PluginManifest>>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.file_type().await?.is_dir() && path.join(MANIFEST_FILE).exists() {
            candidates.push(path);
        }
    }
    candidates.sort();

    let mut manifests: Vec<Arc<PluginManifest>> = Vec::with_capacity(candidates.len());
    for path in candidates {
        match PluginManifest::load(&path).await {
            Ok(manifest) if manifests.iter().any(|m| m.id == manifest.id) => {
                warn!(path = %path.display(), plugin_id = %manifest.id, "duplicate plugin id");
                report.rejected.push(Rejected {
                    path,
                    reason: format!("duplicate plugin id '{}'", manifest.id),
                });
            }
            Ok(manifest) => manifests.push(Arc::new(manifest)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping invalid plugin");
                report.rejected.push(Rejected {
                    path,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(manifests)
}

//! Export and install of plugin bundles
//!
//! A bundle is a plain plugin directory with a signed manifest, so
//! `load` ingests whatever `export` produces.

use crate::catalog::Scope;
use crate::error::{RegistryError, Result};
use crate::manifest::{sign_manifest, PluginManifest, MANIFEST_FILE};
use crate::registry::PluginRegistry;
use serde_json::Value;
use std::ffi::OsStr;
use std::fs::FileType;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SKIPPED_DIRS: &[&str] = &[".venv", "venv", "__pycache__", ".git"];

fn is_skipped(name: &OsStr, file_type: &FileType) -> bool {
    if file_type.is_symlink() {
        return true;
    }
    let name = name.to_string_lossy();
    if file_type.is_dir() {
        SKIPPED_DIRS.contains(&name.as_ref())
    } else {
        name.ends_with(".pyc")
    }
}

/// Copy a plugin tree, leaving out environments, caches and VCS data.
async fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name();
            if is_skipped(&name, &file_type) {
                debug!(path = %entry.path().display(), "skipped in bundle copy");
                continue;
            }
            let target = to.join(&name);
            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

impl PluginRegistry {
    /// Write plugin `id` from `scope` to `<dest>/<id>/` with a signed manifest.
    pub async fn export(&self, scope: &Scope, id: &str, dest: &Path) -> Result<PathBuf> {
        let manifest = self
            .snapshot()
            .plugin(scope, id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let target = dest.join(&manifest.id);
        if tokio::fs::try_exists(&target).await? {
            return Err(RegistryError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", target.display()),
            )));
        }
        copy_tree(&manifest.root, &target).await?;

        let manifest_path = target.join(MANIFEST_FILE);
        let mut value: Value = serde_json::from_str(&tokio::fs::read_to_string(&manifest_path).await?)?;
        let integrity = sign_manifest(&mut value).ok_or_else(|| {
            RegistryError::invalid(&manifest_path, "manifest must be a JSON object")
        })?;
        tokio::fs::write(&manifest_path, serde_json::to_string_pretty(&value)?).await?;

        info!(
            plugin_id = %manifest.id,
            sha256 = %integrity.sha256,
            dest = %target.display(),
            "plugin exported"
        );
        Ok(target)
    }

    /// Validate the bundle at `bundle`, copy it into the scope's plugin
    /// directory (replacing an older copy) and load it.
    ///
    /// A bundle the catalog would reject leaves disk and catalog untouched;
    /// if loading the copied files fails, the previous copy is restored.
    pub async fn install(&self, scope: &Scope, bundle: &Path) -> Result<Arc<PluginManifest>> {
        let incoming = Arc::new(PluginManifest::load(bundle).await?);
        self.snapshot().with_plugin(scope, incoming.clone())?;

        let scope_dir = self.scope_dir(scope);
        tokio::fs::create_dir_all(&scope_dir).await?;
        let target = scope_dir.join(&incoming.id);

        let same_place = match tokio::fs::canonicalize(&target).await {
            Ok(existing) => existing == incoming.root,
            Err(_) => false,
        };
        if same_place {
            let manifest = self.load(scope, &target).await?;
            info!(plugin_id = %manifest.id, scope = %scope, "plugin installed");
            return Ok(manifest);
        }

        let staging = scope_dir.join(format!(".{}.installing", incoming.id));
        let previous = scope_dir.join(format!(".{}.previous", incoming.id));
        for leftover in [&staging, &previous] {
            if tokio::fs::try_exists(leftover).await? {
                tokio::fs::remove_dir_all(leftover).await?;
            }
        }
        copy_tree(&incoming.root, &staging).await?;

        let had_previous = tokio::fs::try_exists(&target).await?;
        if had_previous {
            tokio::fs::rename(&target, &previous).await?;
        }
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            if had_previous {
                tokio::fs::rename(&previous, &target).await?;
            }
            return Err(e.into());
        }

        match self.load(scope, &target).await {
            Ok(manifest) => {
                if had_previous {
                    if let Err(e) = tokio::fs::remove_dir_all(&previous).await {
                        warn!(path = %previous.display(), error = %e, "could not delete replaced copy");
                    }
                }
                info!(plugin_id = %manifest.id, scope = %scope, "plugin installed");
                Ok(manifest)
            }
            Err(e) => {
                warn!(plugin_id = %incoming.id, scope = %scope, error = %e, "install failed, restoring previous copy");
                tokio::fs::remove_dir_all(&target).await?;
                if had_previous {
                    tokio::fs::rename(&previous, &target).await?;
                }
                Err(e)
            }
        }
    }

    /// Deregister plugin `id` and delete its directory if it lives in the
    /// scope's plugin directory.
    pub async fn uninstall(&self, scope: &Scope, id: &str) -> Result<Arc<PluginManifest>> {
        let removed = self.remove(scope, id).await?;
        let Ok(scope_dir) = tokio::fs::canonicalize(self.scope_dir(scope)).await else {
            return Ok(removed);
        };
        if removed.root.starts_with(&scope_dir) && removed.root != scope_dir {
            tokio::fs::remove_dir_all(&removed.root).await?;
            info!(plugin_id = %id, path = %removed.root.display(), "plugin files deleted");
        }
        Ok(removed)
    }
}

//! Plugin manifests
//!
//! A plugin is a directory holding `manifest.json` plus the scripts its
//! actions point at. Loading validates the whole manifest up front; a
//! manifest that fails any check is never partially registered.

use crate::contract::{ParameterContract, RawParameter};
use crate::error::{RegistryError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::debug;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Bumped on every successful manifest load
static LOAD_GENERATION: AtomicU64 = AtomicU64::new(1);

static PLUGIN_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("invalid regex"));

static SEMVER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?$").expect("invalid regex")
});

/// How an action is run.
///
/// Only isolated processes exist today; other kinds become new variants
/// behind the same executor entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Process,
}

/// When an action runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trigger {
    /// Invoked by the model
    #[default]
    Manual,
    /// Run once before the first reasoning step; output becomes prompt context
    PreRequest,
}

/// Signature block written by export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integrity {
    pub sha256: String,
    #[serde(default)]
    pub signed_at: String,
}

/// One executable action of a plugin
#[derive(Debug, Clone)]
pub struct ActionSpec {
    pub plugin_id: String,
    pub name: String,
    pub description: String,
    /// Canonical path of the entry point, inside `plugin_root`
    pub script: PathBuf,
    pub kind: ActionKind,
    pub interpreter: Option<String>,
    pub parameters: ParameterContract,
    /// Zero disables result caching
    pub cache_ttl: Duration,
    pub trigger: Trigger,
    pub plugin_root: PathBuf,
    /// Identifies the load that produced this spec; a reload of the same
    /// plugin yields a new value, so cached results of older code never match.
    pub generation: u64,
}

impl ActionSpec {
    pub fn is_pre_request(&self) -> bool {
        self.trigger == Trigger::PreRequest
    }
}

/// A validated plugin manifest. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub root: PathBuf,
    pub actions: Vec<Arc<ActionSpec>>,
    pub integrity: Option<Integrity>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    id: Option<String>,
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    description: String,
    actions: Option<Vec<RawAction>>,
    integrity: Option<Integrity>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    name: Option<String>,
    script: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: BTreeMap<String, RawParameter>,
    interpreter: Option<String>,
    #[serde(default)]
    cache_ttl: u64,
    trigger: Option<String>,
}

fn required(field: Option<String>, what: &str, path: &Path) -> Result<String> {
    match field.map(|s| s.trim().to_string()) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(RegistryError::invalid(path, format!("missing {}", what))),
    }
}

impl PluginManifest {
    /// Read and validate `<dir>/manifest.json`.
    pub async fn load(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let content = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::invalid(
                    &manifest_path,
                    "manifest.json not found",
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let value: Value = serde_json::from_str(&content)
            .map_err(|e| RegistryError::invalid(&manifest_path, e.to_string()))?;
        if !value.is_object() {
            return Err(RegistryError::invalid(
                &manifest_path,
                "manifest must be a JSON object",
            ));
        }

        let raw: RawManifest = serde_json::from_value(value.clone())
            .map_err(|e| RegistryError::invalid(&manifest_path, e.to_string()))?;

        let id = required(raw.id, "id", &manifest_path)?;
        if !PLUGIN_ID.is_match(&id) {
            return Err(RegistryError::invalid(
                &manifest_path,
                format!("id '{}' must be alphanumeric with '.', '_' or '-'", id),
            ));
        }
        let name = required(raw.name, "name", &manifest_path)?;
        let version = required(raw.version, "version", &manifest_path)?;
        if !SEMVER.is_match(&version) {
            return Err(RegistryError::invalid(
                &manifest_path,
                format!("version '{}' is not semantic", version),
            ));
        }

        let raw_actions = raw.actions.unwrap_or_default();
        if raw_actions.is_empty() {
            return Err(RegistryError::invalid(
                &manifest_path,
                "manifest declares no actions",
            ));
        }

        if let Some(integrity) = &raw.integrity {
            let actual = compute_integrity(&value);
            if !integrity.sha256.eq_ignore_ascii_case(&actual) {
                return Err(RegistryError::IntegrityMismatch {
                    id,
                    expected: integrity.sha256.clone(),
                    actual,
                });
            }
        }

        let root = tokio::fs::canonicalize(dir).await?;
        let generation = LOAD_GENERATION.fetch_add(1, Ordering::Relaxed);
        let mut seen = HashSet::new();
        let mut actions = Vec::with_capacity(raw_actions.len());
        for raw_action in raw_actions {
            let action = resolve_action(raw_action, &id, &root, &manifest_path, generation).await?;
            if !seen.insert(action.name.clone()) {
                return Err(RegistryError::invalid(
                    &manifest_path,
                    format!("duplicate action name '{}'", action.name),
                ));
            }
            actions.push(Arc::new(action));
        }

        debug!(plugin_id = %id, actions = actions.len(), "manifest validated");

        Ok(Self {
            id,
            name,
            version,
            description: raw.description,
            root,
            actions,
            integrity: raw.integrity,
        })
    }

    pub fn action(&self, name: &str) -> Option<&Arc<ActionSpec>> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(|a| a.name.as_str())
    }
}

async fn resolve_action(
    raw: RawAction,
    plugin_id: &str,
    root: &Path,
    manifest_path: &Path,
    generation: u64,
) -> Result<ActionSpec> {
    let name = required(raw.name, "action name", manifest_path)?;
    let script = required(raw.script, &format!("script for action '{}'", name), manifest_path)?;

    let (kind, default_interpreter) = match raw.kind.as_deref() {
        None | Some("process") => (ActionKind::Process, None),
        Some("python") => (ActionKind::Process, Some("python3".to_string())),
        Some(other) => {
            return Err(RegistryError::invalid(
                manifest_path,
                format!("action '{}' has unknown type '{}'", name, other),
            ))
        }
    };
    let interpreter = raw
        .interpreter
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or(default_interpreter);

    let trigger = match raw.trigger.as_deref() {
        None | Some("manual") => Trigger::Manual,
        Some("pre_request") => Trigger::PreRequest,
        Some(other) => {
            return Err(RegistryError::invalid(
                manifest_path,
                format!("action '{}' has unknown trigger '{}'", name, other),
            ))
        }
    };

    let parameters = ParameterContract::from_raw(raw.parameters).map_err(|reason| {
        RegistryError::invalid(manifest_path, format!("action '{}': {}", name, reason))
    })?;
    if trigger == Trigger::PreRequest && parameters.iter().any(|(_, p)| p.required) {
        return Err(RegistryError::invalid(
            manifest_path,
            format!("pre_request action '{}' cannot require parameters", name),
        ));
    }

    let declared = root.join(&script);
    let script_path = match tokio::fs::canonicalize(&declared).await {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RegistryError::EntryPointMissing {
                action: name,
                path: declared,
            })
        }
        Err(e) => return Err(e.into()),
    };
    if !script_path.starts_with(root) {
        return Err(RegistryError::invalid(
            manifest_path,
            format!("script for action '{}' is outside the plugin directory", name),
        ));
    }
    if !tokio::fs::metadata(&script_path).await?.is_file() {
        return Err(RegistryError::EntryPointMissing {
            action: name,
            path: declared,
        });
    }

    Ok(ActionSpec {
        plugin_id: plugin_id.to_string(),
        name,
        description: raw.description,
        script: script_path,
        kind,
        interpreter,
        parameters,
        cache_ttl: Duration::from_secs(raw.cache_ttl),
        trigger,
        plugin_root: root.to_path_buf(),
        generation,
    })
}

/// Rebuild `value` with every object's keys in sorted order.
pub(crate) fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact JSON with sorted keys, stable across runs
pub(crate) fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// SHA-256 (hex) of the manifest without its `integrity` field.
pub fn compute_integrity(manifest: &Value) -> String {
    let mut unsigned = manifest.clone();
    if let Value::Object(map) = &mut unsigned {
        map.remove("integrity");
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&unsigned).as_bytes());
    hex::encode(hasher.finalize())
}

/// Replace the manifest's `integrity` block with a fresh signature.
pub fn sign_manifest(manifest: &mut Value) -> Option<Integrity> {
    let integrity = Integrity {
        sha256: compute_integrity(manifest),
        signed_at: chrono::Utc::now().to_rfc3339(),
    };
    let map = manifest.as_object_mut()?;
    map.insert(
        "integrity".to_string(),
        serde_json::to_value(&integrity).ok()?,
    );
    Some(integrity)
}

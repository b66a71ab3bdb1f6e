//! Plugin catalog and action execution
//!
//! [`PluginRegistry`] discovers and validates plugin manifests per scope and
//! publishes immutable [`Catalog`] snapshots. [`ActionExecutor`] runs one
//! resolved [`ActionSpec`] as an isolated, time-bounded process.

pub mod bundle;
pub mod cache;
pub mod catalog;
pub mod contract;
pub mod error;
pub mod executor;
pub mod manifest;
pub mod registry;

pub use cache::ResultCache;
pub use catalog::{Catalog, Scope};
pub use contract::{ParamType, ParameterContract, ParameterSpec};
pub use error::{ExecutorError, RegistryError, Result, RunError};
pub use executor::{
    ActionExecutor, ActionOutcome, ActionResult, ExecutorSettings, InfraKind,
};
pub use manifest::{
    compute_integrity, ActionKind, ActionSpec, Integrity, PluginManifest, Trigger, MANIFEST_FILE,
};
pub use registry::{PluginRegistry, Rejected, ReloadReport};

use serde_json::Value;

/// A request to run one action on behalf of a caller
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub name: String,
    pub scope: Scope,
    pub arguments: Value,
}

impl ActionRequest {
    pub fn new(name: impl Into<String>, scope: Scope, arguments: Value) -> Self {
        Self {
            name: name.into(),
            scope,
            arguments,
        }
    }
}

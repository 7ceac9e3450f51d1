//! Engine configuration: built-in defaults, then an optional file, then
//! `RECORDKIT_` environment variables (nested keys separated by `__`).
use std::sync::Arc;

use ::config::{Config, Environment, File};
use serde::Deserialize;
use tracing::info;

use crate::env::Env;
use crate::persist::SqlitePersistor;
use crate::registry::Registry;
use crate::storage::{MemoryStorage, Storage};
use crate::{RecordkitError, Result};

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Memory,
    SqliteMemory,
    SqliteFile { path: String },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageMode,
    /// An `EnvFilter` directive, e.g. `"info"` or `"recordkit=debug"`.
    pub log_filter: String,
    /// Caps searches that do not ask for a limit.
    pub default_limit: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { storage: StorageMode::Memory, log_filter: "info".to_string(), default_limit: None }
    }
}

impl EngineConfig {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("RECORDKIT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        builder
            .build()
            .and_then(|settings| settings.try_deserialize::<EngineConfig>())
            .map_err(|e| RecordkitError::Config(e.to_string()))
    }

    pub fn open_storage(&self, registry: &Arc<Registry>) -> Result<Arc<dyn Storage>> {
        let storage: Arc<dyn Storage> = match &self.storage {
            StorageMode::Memory => Arc::new(MemoryStorage::new()),
            StorageMode::SqliteMemory => Arc::new(SqlitePersistor::open_in_memory(Arc::clone(registry))?),
            StorageMode::SqliteFile { path } => Arc::new(SqlitePersistor::open(path, Arc::clone(registry))?),
        };
        info!("Opened {:?} storage for {} models", self.storage, registry.len());
        Ok(storage)
    }

    /// An environment over freshly opened storage, with this configuration's limits.
    pub fn env(&self, registry: Arc<Registry>) -> Result<Env> {
        let storage = self.open_storage(&registry)?;
        Ok(Env::new(registry, storage).with_default_limit(self.default_limit))
    }
}

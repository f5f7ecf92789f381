use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Per-facility engines, keyed by the database name a client connects with.
/// Each facility gets its own WAL, sweeper and compactor.
pub struct FacilityManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    config: EngineConfig,
}

impl FacilityManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, config: EngineConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            config,
        }
    }

    /// Get or lazily open the engine for `facility`.
    pub fn get_or_create(&self, facility: &str) -> io::Result<Arc<Engine>> {
        if facility.len() > MAX_FACILITY_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "facility name too long",
            ));
        }
        // Strip anything that could escape the data directory.
        let safe_name: String = facility
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty facility name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_FACILITIES {
            return Err(io::Error::other("too many facilities"));
        }

        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::open(wal_path, notify, self.config.clone())?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(reaper::run_sweeper(engine.clone()));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

        info!(facility = %safe_name, "facility opened");
        metrics::gauge!(crate::observability::FACILITIES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

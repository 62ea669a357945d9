//! Role-keyed model snapshots.
//!
//! A [`StateDict`] maps role names ("disc", "gen", "crow", "taxi", ...) to module records
//! serialized with burn's in-memory bincode recorder at full precision. A checkpoint
//! directory holds the run configuration as `config.json` plus one `<role>.bin` per role.
//!
//! Optimizer moments are deliberately absent: loading a snapshot restores weights and
//! normalization statistics only.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn_core as burn;

use burn::module::Module;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use tracing::debug;

use crate::config::RunConfig;
use crate::{Error, Result};

type Bytes = BinBytesRecorder<FullPrecisionSettings>;

const CONFIG_FILE: &str = "config.json";
const ROLE_EXT: &str = "bin";

/// Serialized module records keyed by role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDict {
    roles: BTreeMap<String, Vec<u8>>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `module` under `role`, replacing any previous entry.
    pub fn put_module<B: Backend, M: Module<B>>(&mut self, role: &str, module: M) -> Result<()> {
        let bytes = <Bytes as Recorder<B>>::record(&Bytes::default(), module.into_record(), ())?;
        self.roles.insert(role.to_string(), bytes);
        Ok(())
    }

    /// Load the record stored under `role` into `module`.
    pub fn load_module<B: Backend, M: Module<B>>(
        &self,
        role: &str,
        module: M,
        device: &B::Device,
    ) -> Result<M> {
        let bytes = self.bytes(role)?.to_vec();
        let record = <Bytes as Recorder<B>>::load(&Bytes::default(), bytes, device)?;
        Ok(module.load_record(record))
    }

    pub fn bytes(&self, role: &str) -> Result<&[u8]> {
        self.roles
            .get(role)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::MissingRole(role.to_string()))
    }

    pub fn insert_bytes(&mut self, role: &str, bytes: Vec<u8>) {
        self.roles.insert(role.to_string(), bytes);
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

fn role_path(dir: &Path, role: &str) -> PathBuf {
    dir.join(format!("{role}.{ROLE_EXT}"))
}

/// Write `config.json` and one file per role into `dir` (created if missing).
pub fn save_checkpoint(dir: impl AsRef<Path>, config: &RunConfig, state: &StateDict) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    config.to_json_file(dir.join(CONFIG_FILE))?;
    for (role, bytes) in &state.roles {
        fs::write(role_path(dir, role), bytes)?;
    }
    debug!(dir = %dir.display(), roles = state.roles.len(), "checkpoint written");
    Ok(())
}

/// Read a checkpoint written by [`save_checkpoint`]. A directory with a config but no role
/// files is an error.
pub fn load_checkpoint(dir: impl AsRef<Path>) -> Result<(RunConfig, StateDict)> {
    let dir = dir.as_ref();
    let config = RunConfig::from_json_file(dir.join(CONFIG_FILE))?;
    let mut state = StateDict::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ROLE_EXT) {
            continue;
        }
        let Some(role) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        state.insert_bytes(role, fs::read(&path)?);
    }
    if state.is_empty() {
        return Err(Error::Domain("checkpoint directory has no role files"));
    }
    Ok((config, state))
}

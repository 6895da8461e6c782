//! Network metadata persistence
//!
//! On SIGHUP and on graceful shutdown the server serialises the network
//! contexts (never the peers) to a JSON state file; startup reloads it. A
//! missing file is an empty directory, not an error.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PeermapError, PeermapResult};

/// Persisted form of one network context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetState {
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub neighbors: Vec<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

pub fn load(path: &Path) -> PeermapResult<Vec<NetState>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(PeermapError::State(format!("open {:?}: {}", path, err))),
    };
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let nets: Vec<NetState> = serde_json::from_slice(&data)
        .map_err(|err| PeermapError::State(format!("decode {:?}: {}", path, err)))?;
    info!(count = nets.len(), "loaded networks");
    Ok(nets)
}

pub fn save(path: &Path, nets: &[NetState]) -> PeermapResult<()> {
    if nets.is_empty() {
        return Ok(());
    }
    let data = serde_json::to_vec(nets)
        .map_err(|err| PeermapError::State(format!("encode state: {}", err)))?;
    fs::write(path, data).map_err(|err| PeermapError::State(format!("write {:?}: {}", path, err)))?;
    info!(count = nets.len(), "saved networks");
    Ok(())
}

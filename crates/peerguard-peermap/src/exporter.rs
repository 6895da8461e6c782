//! Exporter API contracts
//!
//! Read-only monitoring surface guarded by `X-Token` under the exporter
//! authenticator. Route handlers live in the server module; this one holds
//! the response and request shapes.

use serde::{Deserialize, Serialize};

/// Summary row of `GET /networks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkHead {
    pub id: String,
    pub peers_count: usize,
    /// Unix nanoseconds, stringified
    pub create_time: String,
}

/// Row of `GET /peers`: every session rendered in its `pg://` string form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub peers: Vec<String>,
}

/// Body of `PUT /network/{network}/meta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutNetworkMetaRequest {
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub neighbors: Vec<String>,
}

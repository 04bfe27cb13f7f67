//! Durable state file for the routing model.
//!
//! The whole model is written on every save; entry points are stored by node
//! id and re-resolved on load.

use crate::model::{Endpoint, EntryPoint, ModelError, Node, RoutingModel};
use crate::render::{write_atomic, RenderError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Version tag written to new state files
pub const STATE_VERSION: &str = "0.1";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {} does not exist; provision it (an empty file is valid) before starting", .0.display())]
    Missing(PathBuf),

    #[error("failed to read state file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("failed to write state file: {0}")]
    Write(#[source] RenderError),

    #[error("unsupported state version '{0}'")]
    UnsupportedVersion(String),

    #[error("entry point {domain}{path} references node '{node_id}' which is not in the state file")]
    OrphanedEntryPoint {
        domain: String,
        path: String,
        node_id: String,
    },

    #[error("state file is inconsistent: {0}")]
    Invalid(#[source] ModelError),
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "node")]
    nodes: Vec<StoredNode>,
    #[serde(default, rename = "entry_point")]
    entry_points: Vec<StoredEntryPoint>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredNode {
    key: String,
    node_id: String,
    #[serde(default, rename = "endpoint")]
    endpoints: Vec<StoredEndpoint>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEndpoint {
    destination: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntryPoint {
    domain: String,
    path: String,
    node_id: String,
}

fn default_version() -> String {
    STATE_VERSION.to_string()
}

/// Serialize a model to the state document format
pub fn encode(model: &RoutingModel) -> Result<String, StateError> {
    let document = StateDocument {
        version: STATE_VERSION.to_string(),
        saved_at: Some(Utc::now()),
        nodes: model
            .nodes()
            .iter()
            .map(|node| StoredNode {
                key: node.key.clone(),
                node_id: node.node_id.clone(),
                endpoints: node
                    .endpoints
                    .iter()
                    .map(|e| StoredEndpoint {
                        destination: e.destination.clone(),
                    })
                    .collect(),
            })
            .collect(),
        entry_points: model
            .entry_points()
            .iter()
            .map(|entry| StoredEntryPoint {
                domain: entry.domain.clone(),
                path: entry.path.clone(),
                node_id: entry.node_id.clone(),
            })
            .collect(),
    };

    Ok(toml::to_string(&document)?)
}

/// Rebuild a model from a parsed document.
///
/// Nodes are loaded first, then every entry point is resolved against them;
/// an entry point whose node is absent aborts the load.
fn decode_document(document: StateDocument) -> Result<RoutingModel, StateError> {
    if document.version.split('.').next() != STATE_VERSION.split('.').next() {
        return Err(StateError::UnsupportedVersion(document.version));
    }

    let mut model = RoutingModel::new();

    for stored in document.nodes {
        let node = Node {
            key: stored.key,
            node_id: stored.node_id,
            endpoints: stored
                .endpoints
                .into_iter()
                .map(|e| Endpoint::new(e.destination))
                .collect(),
        };
        model.add_node(node).map_err(StateError::Invalid)?;
    }

    for stored in document.entry_points {
        let entry = EntryPoint::new(stored.domain, stored.path, stored.node_id);
        match model.add_entry_point(entry.clone()) {
            Ok(()) => {}
            Err(ModelError::UnknownNodeId(_)) => {
                return Err(StateError::OrphanedEntryPoint {
                    domain: entry.domain,
                    path: entry.path,
                    node_id: entry.node_id,
                });
            }
            Err(e) => return Err(StateError::Invalid(e)),
        }
    }

    Ok(model)
}

/// The on-disk home of the routing model
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the model. A missing file is an error, not an empty model.
    pub fn load(&self) -> Result<RoutingModel, StateError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::Missing(self.path.clone()));
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let document: StateDocument = toml::from_str(&content).map_err(|source| StateError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let model = decode_document(document)?;

        info!(
            path = %self.path.display(),
            nodes = model.nodes().len(),
            entry_points = model.entry_points().len(),
            "Loaded routing state"
        );
        Ok(model)
    }

    /// Replace the state file with the full current model
    pub fn save(&self, model: &RoutingModel) -> Result<(), StateError> {
        let content = encode(model)?;
        write_atomic(&self.path, content.as_bytes()).map_err(StateError::Write)?;
        debug!(path = %self.path.display(), "Saved routing state");
        Ok(())
    }
}

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use burn_distributed::DeviceType;
use burn_distributed::sharding::DeviceMesh;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Options of a `fully_shard` call.
///
/// Missing fields take their default when deserialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsdpOptions {
    /// Whether parameters are resharded after the forward of their unit.
    pub reshard_after_forward: bool,
    /// Tensor dimension parameters are sharded along.
    pub shard_dim: usize,
    /// Device type of the default mesh, used when no mesh is given.
    pub device_type: DeviceType,
}

impl Default for FsdpOptions {
    fn default() -> Self {
        Self {
            reshard_after_forward: true,
            shard_dim: 0,
            device_type: DeviceType::Cuda,
        }
    }
}

impl FsdpOptions {
    /// Parses options from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads options from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Serializes the options to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Mesh and options of a `fully_shard` call.
///
/// Without a mesh, a 1D mesh over the whole world is created with the options' device type.
#[derive(Clone, Debug, Default)]
pub struct FullyShardConfig {
    mesh: Option<DeviceMesh>,
    options: FsdpOptions,
}

impl FullyShardConfig {
    /// Creates a configuration with the default options and no mesh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shards over `mesh`.
    pub fn with_mesh(mut self, mesh: DeviceMesh) -> Self {
        self.mesh = Some(mesh);
        self
    }

    /// Replaces the options.
    pub fn with_options(mut self, options: FsdpOptions) -> Self {
        self.options = options;
        self
    }

    /// The mesh, if one was given.
    pub fn mesh(&self) -> Option<&DeviceMesh> {
        self.mesh.as_ref()
    }

    /// The options.
    pub fn options(&self) -> &FsdpOptions {
        &self.options
    }
}

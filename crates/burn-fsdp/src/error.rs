use burn_distributed::sharding::DeviceMeshError;
use burn_distributed::{DeviceType, DistributedError};
use thiserror::Error;

/// Errors raised while wrapping, initializing or running fully sharded modules.
#[derive(Error, Debug)]
pub enum FsdpError {
    /// The sharding mesh is neither 1D nor 2D.
    #[error("fully_shard expects a 1D or 2D DeviceMesh but got {mesh}")]
    InvalidMesh {
        /// Rendering of the rejected mesh.
        mesh: String,
    },

    /// An upstream sharded parameter lives on a mesh of another device type.
    #[error(
        "Requires DTensor to have mesh of the same type as the FSDP mesh but got {tensor} for DTensor and {mesh} for FSDP"
    )]
    MeshDeviceMismatch {
        /// Device type of the parameter's mesh.
        tensor: DeviceType,
        /// Device type of the sharding mesh.
        mesh: DeviceType,
    },

    /// A 0-dimensional parameter cannot be sharded.
    #[error(
        "fully_shard doesn't support scalar parameters. Change {name} to a 1D tensor with numel equals to 1."
    )]
    ScalarParameter {
        /// Attribute name of the parameter.
        name: String,
    },

    /// A nested unit was initialized before the root.
    #[error(
        "FSDP state has already been lazily initialized for {module_fqn}\nFSDP requires running forward through the root module first"
    )]
    AlreadyLazilyInitialized {
        /// Module FQN of the offending unit.
        module_fqn: String,
    },

    /// A unit wraps several modules and cannot act as the root.
    #[error("FSDP requires a single root module but got {modules}")]
    MultipleRoots {
        /// Rendering of the wrapped modules.
        modules: String,
    },

    /// Parameters are still on the meta device at forward time.
    #[error(
        "FSDP parameters should be materialized from meta device before training, but the following were still on meta device: {}",
        python_list(.0)
    )]
    MetaParameters(Vec<String>),

    /// Some managed parameters cannot be reached from the module tree.
    #[error("{} parameter(s) not found in the module tree: {}", .0.len(), python_list(.0))]
    MissingFromModuleTree(Vec<String>),

    /// Composition with an upstream parallelism that is not supported.
    #[error("unsupported composition: {0}")]
    UnsupportedComposition(String),

    /// The module was never wrapped with `fully_shard`.
    #[error("module {0} is not managed by fully_shard")]
    NotWrapped(String),

    /// A managed parameter was replaced by a tensor that is not sharded.
    #[error("managed parameter {fqn} is not sharded")]
    NotSharded {
        /// FQN (or attribute name) of the parameter.
        fqn: String,
    },

    /// A state dict does not cover the module tree exactly.
    #[error("state dict mismatch: missing keys {}, unexpected keys {}", python_list(.missing), python_list(.unexpected))]
    StateDictMismatch {
        /// Tree entries absent from the state dict.
        missing: Vec<String>,
        /// State dict entries absent from the tree.
        unexpected: Vec<String>,
    },

    /// Module tree lookup failure.
    #[error("module {module} has no tensor attribute '{name}'")]
    UnknownAttribute {
        /// Type name of the module.
        module: String,
        /// Requested attribute.
        name: String,
    },

    /// Options could not be read.
    #[error("invalid options: {0}")]
    Options(#[from] serde_json::Error),

    /// Options file could not be opened.
    #[error("cannot read options file: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the distributed layer.
    #[error(transparent)]
    Distributed(#[from] DistributedError),

    /// Error from the device mesh.
    #[error(transparent)]
    Mesh(#[from] DeviceMeshError),
}

/// Result type of the fsdp crate.
pub type Result<T> = core::result::Result<T, FsdpError>;

fn python_list(names: &[String]) -> String {
    let quoted: Vec<String> = names.iter().map(|name| format!("'{name}'")).collect();
    format!("[{}]", quoted.join(", "))
}

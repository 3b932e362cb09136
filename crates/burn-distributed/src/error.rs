use thiserror::Error;

use crate::Device;
use crate::sharding::DeviceMeshError;

/// Errors raised by distributed tensors and collectives.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistributedError {
    /// The tensor has no storage because it lives on the meta device.
    #[error("tensor of shape {shape:?} is on the meta device and has no storage")]
    MetaTensor {
        /// Shape of the offending tensor.
        shape: Vec<usize>,
    },

    /// Tensor shapes do not line up.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// A dimension index is out of range for the tensor rank.
    #[error("dimension {dim} is out of range for a tensor with {ndim} dimension(s)")]
    DimOutOfRange {
        /// Requested dimension.
        dim: usize,
        /// Rank of the tensor.
        ndim: usize,
    },

    /// Tensors of a collective are on different devices.
    #[error("tensor device mismatch: expected {expected}, got {actual}")]
    DeviceMismatch {
        /// Expected device.
        expected: Device,
        /// Actual device.
        actual: Device,
    },

    /// The calling rank is not part of the process group.
    #[error("rank {rank} is not a member of process group {ranks:?}")]
    NotInGroup {
        /// Calling (or source) rank.
        rank: usize,
        /// Ranks of the group.
        ranks: Vec<usize>,
    },

    /// A process group definition is invalid.
    #[error("invalid process group {ranks:?}: {reason}")]
    InvalidGroup {
        /// Requested ranks.
        ranks: Vec<usize>,
        /// Why it is invalid.
        reason: String,
    },

    /// The placements do not describe a valid layout on the mesh.
    #[error("invalid placements: {0}")]
    InvalidPlacements(String),

    /// Error from the device mesh.
    #[error("device mesh error: {0}")]
    Mesh(#[from] DeviceMeshError),
}

/// Result type of the distributed crate.
pub type Result<T> = core::result::Result<T, DistributedError>;

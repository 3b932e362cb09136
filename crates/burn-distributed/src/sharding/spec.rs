use core::fmt;
use core::ops::Range;

use serde::{Deserialize, Serialize};

use super::DeviceMesh;
use crate::{DistributedError, Result, contiguous_strides};

/// Specifies how a tensor is distributed along one mesh dimension.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// The tensor dimension is split into one contiguous chunk per rank of the mesh dimension.
    Shard(usize),
    /// The tensor dimension is split across the mesh dimension after it has already been
    /// split `split_factor` ways by the plain shards of other mesh dimensions.
    ///
    /// Each rank holds a chunk of its already-sharded piece, so the rank's data is strided
    /// over the full dimension.
    StridedShard {
        /// Tensor dimension.
        dim: usize,
        /// Number of pieces the dimension is split into before this placement applies.
        split_factor: usize,
    },
    /// Every rank of the mesh dimension holds an identical copy.
    Replicate,
}

impl Placement {
    /// Tensor dimension split by this placement, if any.
    pub fn shard_dim(&self) -> Option<usize> {
        match self {
            Placement::Shard(dim) | Placement::StridedShard { dim, .. } => Some(*dim),
            Placement::Replicate => None,
        }
    }

    /// Whether the placement splits the tensor.
    pub fn is_shard(&self) -> bool {
        self.shard_dim().is_some()
    }

    /// Whether the placement is a full copy.
    pub fn is_replicate(&self) -> bool {
        matches!(self, Placement::Replicate)
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Shard(dim) => write!(f, "Shard(dim={dim})"),
            Placement::StridedShard { dim, split_factor } => {
                write!(f, "_StridedShard(dim={dim}, sf={split_factor})")
            }
            Placement::Replicate => f.write_str("Replicate()"),
        }
    }
}

/// Range of chunk `index` when `len` elements are split into `num_chunks` contiguous chunks.
///
/// Chunk sizes differ by at most one, the leading chunks take the remainder, and trailing
/// chunks are empty when there are more chunks than elements.
pub fn chunk_range(len: usize, num_chunks: usize, index: usize) -> Range<usize> {
    let base = len / num_chunks;
    let remainder = len % num_chunks;
    let start = index * base + index.min(remainder);
    let size = base + usize::from(index < remainder);
    start..start + size
}

/// Describes how a tensor is distributed across a device mesh.
///
/// Holds one [`Placement`] per mesh dimension along with the global shape. Plain shards
/// are applied first in mesh-dimension order, then strided shards, each one splitting the
/// range left by the previous ones.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardingSpec {
    /// Placement along each mesh dimension.
    placements: Vec<Placement>,
    /// The device mesh the tensor is distributed over.
    device_mesh: DeviceMesh,
    /// Global shape of the tensor.
    global_shape: Vec<usize>,
}

impl ShardingSpec {
    /// Creates a sharding spec, checking the placements against the mesh and shape.
    pub fn new(
        device_mesh: DeviceMesh,
        placements: Vec<Placement>,
        global_shape: Vec<usize>,
    ) -> Result<Self> {
        if placements.len() != device_mesh.ndim() {
            return Err(DistributedError::InvalidPlacements(format!(
                "Expects one placement per mesh dimension but got {} for {}",
                placements.len(),
                device_mesh
            )));
        }

        let ndim = global_shape.len();
        for placement in &placements {
            match placement.shard_dim() {
                Some(dim) if dim >= ndim => {
                    return Err(DistributedError::InvalidPlacements(format!(
                        "{} is out of range for a tensor of shape {:?}",
                        placement, global_shape
                    )));
                }
                _ => {}
            }
            if let Placement::StridedShard { dim, split_factor } = *placement {
                let expected: usize = placements
                    .iter()
                    .zip(device_mesh.shape())
                    .filter(|(p, _)| **p == Placement::Shard(dim))
                    .map(|(_, size)| *size)
                    .product();
                if split_factor != expected {
                    return Err(DistributedError::InvalidPlacements(format!(
                        "{} expects a split factor of {} on mesh shape {:?}",
                        placement,
                        expected,
                        device_mesh.shape()
                    )));
                }
            }
        }

        Ok(Self {
            placements,
            device_mesh,
            global_shape,
        })
    }

    /// Placement along each mesh dimension.
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// The device mesh.
    pub fn device_mesh(&self) -> &DeviceMesh {
        &self.device_mesh
    }

    /// Global shape.
    pub fn global_shape(&self) -> &[usize] {
        &self.global_shape
    }

    /// Contiguous strides of the global tensor.
    pub fn stride(&self) -> Vec<usize> {
        contiguous_strides(&self.global_shape)
    }

    /// Ranges of the global tensor held by the rank at `coordinate`, one per tensor dimension.
    pub fn local_ranges(&self, coordinate: &[usize]) -> Result<Vec<Range<usize>>> {
        if coordinate.len() != self.device_mesh.ndim() {
            return Err(DistributedError::InvalidPlacements(format!(
                "Coordinate {:?} does not address {}",
                coordinate, self.device_mesh
            )));
        }

        let mut ranges: Vec<Range<usize>> = self.global_shape.iter().map(|&size| 0..size).collect();
        for (mesh_dim, dim) in self.application_order() {
            let range = ranges[dim].clone();
            let chunk = chunk_range(
                range.len(),
                self.device_mesh.size_of(mesh_dim),
                coordinate[mesh_dim],
            );
            ranges[dim] = range.start + chunk.start..range.start + chunk.end;
        }
        Ok(ranges)
    }

    /// Shape of the local shard held by the rank at `coordinate`.
    pub fn local_shape(&self, coordinate: &[usize]) -> Result<Vec<usize>> {
        Ok(self
            .local_ranges(coordinate)?
            .iter()
            .map(|range| range.len())
            .collect())
    }

    /// `(mesh dim, tensor dim)` pairs in the order their splits apply.
    fn application_order(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let plain = self.placements.iter().enumerate().filter_map(|(mesh_dim, p)| match p {
            Placement::Shard(dim) => Some((mesh_dim, *dim)),
            _ => None,
        });
        let strided = self.placements.iter().enumerate().filter_map(|(mesh_dim, p)| match p {
            Placement::StridedShard { dim, .. } => Some((mesh_dim, *dim)),
            _ => None,
        });
        plain.chain(strided)
    }
}

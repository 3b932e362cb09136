use ndarray::Dimension;

use crate::sharding::{DeviceMesh, DeviceMeshError, Placement, ShardingSpec};
use crate::{Collective, DType, Device, DistributedError, Result, Tensor};

/// Represents a tensor that is distributed (sharded or replicated) across multiple devices.
///
/// A `ShardedTensor` contains the calling rank's local shard of a global tensor, along with
/// metadata describing how the full tensor is partitioned across the ranks of a mesh. The
/// distribution is defined by a [`ShardingSpec`], which holds one [`Placement`] per mesh
/// dimension and the global shape.
///
/// Equality is placement-aware: two sharded tensors are equal when their local shards,
/// meshes, placements and global shapes are equal.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardedTensor {
    /// Local shard of the tensor
    local_shard: Tensor,
    /// Specification of how this tensor is sharded
    sharding_spec: ShardingSpec,
}

/// Shards `full` over `mesh` and returns the calling rank's piece.
///
/// Every rank is expected to pass the same full tensor. Meta tensors produce meta shards.
pub fn distribute_tensor(
    full: &Tensor,
    mesh: &DeviceMesh,
    placements: Vec<Placement>,
) -> Result<ShardedTensor> {
    let spec = ShardingSpec::new(mesh.clone(), placements, full.shape().to_vec())?;
    let coordinate = member_coordinate(mesh)?;
    let local_shard = full.slice(&spec.local_ranges(coordinate)?)?;
    Ok(ShardedTensor {
        local_shard,
        sharding_spec: spec,
    })
}

fn member_coordinate(mesh: &DeviceMesh) -> Result<&[usize]> {
    mesh.coordinate().ok_or_else(|| {
        DistributedError::Mesh(DeviceMeshError::InvalidMesh(format!(
            "The calling rank is not part of {}",
            mesh
        )))
    })
}

impl ShardedTensor {
    /// Wraps a local shard, checking its shape against its sharding spec.
    pub fn new(local_shard: Tensor, sharding_spec: ShardingSpec) -> Result<Self> {
        let coordinate = member_coordinate(sharding_spec.device_mesh())?;
        let expected = sharding_spec.local_shape(coordinate)?;
        if local_shard.shape() != expected.as_slice() {
            return Err(DistributedError::ShapeMismatch {
                expected,
                actual: local_shard.shape().to_vec(),
            });
        }
        Ok(Self {
            local_shard,
            sharding_spec,
        })
    }

    /// Builds a sharded tensor from the calling rank's shard.
    pub fn from_local(
        local_shard: Tensor,
        mesh: &DeviceMesh,
        placements: Vec<Placement>,
        global_shape: Vec<usize>,
    ) -> Result<Self> {
        Self::new(
            local_shard,
            ShardingSpec::new(mesh.clone(), placements, global_shape)?,
        )
    }

    /// The local shard.
    pub fn to_local(&self) -> &Tensor {
        &self.local_shard
    }

    /// The local shard, mutably. Its shape must not change.
    pub fn local_mut(&mut self) -> &mut Tensor {
        &mut self.local_shard
    }

    /// Consumes the sharded tensor, returning the local shard.
    pub fn into_local(self) -> Tensor {
        self.local_shard
    }

    /// Replaces the local shard with a tensor of the same shape.
    pub fn set_local(&mut self, local_shard: Tensor) -> Result<()> {
        if local_shard.shape() != self.local_shard.shape() {
            return Err(DistributedError::ShapeMismatch {
                expected: self.local_shard.shape().to_vec(),
                actual: local_shard.shape().to_vec(),
            });
        }
        self.local_shard = local_shard;
        Ok(())
    }

    /// The sharding spec.
    pub fn sharding_spec(&self) -> &ShardingSpec {
        &self.sharding_spec
    }

    /// Placement along each mesh dimension.
    pub fn placements(&self) -> &[Placement] {
        self.sharding_spec.placements()
    }

    /// The mesh the tensor is distributed over.
    pub fn device_mesh(&self) -> &DeviceMesh {
        self.sharding_spec.device_mesh()
    }

    /// Global shape.
    pub fn shape(&self) -> &[usize] {
        self.sharding_spec.global_shape()
    }

    /// Global contiguous strides.
    pub fn stride(&self) -> Vec<usize> {
        self.sharding_spec.stride()
    }

    /// Number of global dimensions.
    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Number of global elements.
    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Element type of the local shard.
    pub fn dtype(&self) -> DType {
        self.local_shard.dtype()
    }

    /// Device of the local shard.
    pub fn device(&self) -> Device {
        self.local_shard.device()
    }

    /// Whether the local shard lives on the meta device.
    pub fn is_meta(&self) -> bool {
        self.local_shard.is_meta()
    }

    /// Moves the local shard to `device`.
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            local_shard: self.local_shard.to_device(device),
            sharding_spec: self.sharding_spec.clone(),
        }
    }

    /// Allocates storage for a meta local shard.
    pub fn to_empty(&self, device: Device) -> Self {
        Self {
            local_shard: self.local_shard.to_empty(device),
            sharding_spec: self.sharding_spec.clone(),
        }
    }

    /// Gathers every rank's shard and reassembles the global tensor on every rank.
    pub fn full_tensor(&self, comm: &dyn Collective) -> Result<Tensor> {
        let mesh = self.device_mesh();
        let group = comm.new_group(mesh.ranks())?;
        let shards = comm.all_gather(&self.local_shard, &group)?;
        let full = Self::assemble(&self.sharding_spec, &shards)?;
        Ok(full.to_device(self.device()))
    }

    /// Reassembles the global tensor from every rank's shard, in row-major mesh order.
    pub fn assemble(spec: &ShardingSpec, shards: &[Tensor]) -> Result<Tensor> {
        let mesh = spec.device_mesh();
        if shards.len() != mesh.size() {
            return Err(DistributedError::ShapeMismatch {
                expected: mesh.shape().to_vec(),
                actual: vec![shards.len()],
            });
        }
        if shards.iter().any(Tensor::is_meta) {
            return Ok(Tensor::meta(spec.global_shape()));
        }

        let device = shards.first().map(Tensor::device).unwrap_or_default();
        let mut full = Tensor::zeros(spec.global_shape(), device);
        for ((index, _), shard) in mesh.mesh().indexed_iter().zip(shards) {
            let ranges = spec.local_ranges(index.slice())?;
            full.assign_slice(&ranges, shard)?;
        }
        if let Some(shard) = shards.first() {
            full = full.to_dtype(shard.dtype());
        }
        Ok(full)
    }
}

use burn_distributed::sharding::{DeviceMesh, Placement, chunk_range};
use burn_distributed::{
    Collective, Device, DistributedError, ProcessGroup, ShardedTensor, Tensor, distribute_tensor,
};

use crate::{FsdpError, ModuleTree, ParamModuleInfo, Result, TensorId, TensorValue};

/// The sharding mesh with the role of each of its dimensions.
///
/// A 1D mesh only shards. A 2D mesh replicates along dimension 0 and shards along
/// dimension 1 (hybrid sharding).
#[derive(Clone, Debug, PartialEq)]
pub struct FsdpMeshInfo {
    mesh: DeviceMesh,
    shard_mesh_dim: usize,
    replicate_mesh_dim: Option<usize>,
}

impl FsdpMeshInfo {
    /// Assigns roles to the dimensions of `mesh`.
    pub fn new(mesh: DeviceMesh) -> Result<Self> {
        let (shard_mesh_dim, replicate_mesh_dim) = match mesh.ndim() {
            1 => (0, None),
            2 => (1, Some(0)),
            _ => {
                return Err(FsdpError::InvalidMesh {
                    mesh: mesh.to_string(),
                });
            }
        };
        Ok(Self {
            mesh,
            shard_mesh_dim,
            replicate_mesh_dim,
        })
    }

    /// The mesh.
    pub fn mesh(&self) -> &DeviceMesh {
        &self.mesh
    }

    /// Mesh dimension parameters are sharded along.
    pub fn shard_mesh_dim(&self) -> usize {
        self.shard_mesh_dim
    }

    /// Mesh dimension parameters are replicated along, for hybrid sharding.
    pub fn replicate_mesh_dim(&self) -> Option<usize> {
        self.replicate_mesh_dim
    }

    /// Whether parameters are also replicated.
    pub fn is_hybrid(&self) -> bool {
        self.replicate_mesh_dim.is_some()
    }

    /// Process group of the caller along the shard dimension.
    pub fn shard_group(&self) -> Result<&ProcessGroup> {
        Ok(self.mesh.get_group(self.shard_mesh_dim)?)
    }

    /// Number of shards.
    pub fn shard_size(&self) -> usize {
        self.mesh.size_of(self.shard_mesh_dim)
    }

    /// Index of the caller's shard.
    pub fn shard_rank(&self) -> Result<usize> {
        Ok(self.mesh.get_local_rank(self.shard_mesh_dim)?)
    }

    /// Placements of a parameter sharded along `shard_dim` on this mesh.
    pub fn placements(&self, shard_dim: usize) -> Vec<Placement> {
        match self.replicate_mesh_dim {
            Some(_) => vec![Placement::Replicate, Placement::Shard(shard_dim)],
            None => vec![Placement::Shard(shard_dim)],
        }
    }
}

/// Mesh and placements of a parameter sharded by another parallelism before wrapping.
#[derive(Clone, Debug, PartialEq)]
struct UpstreamSharding {
    mesh: DeviceMesh,
    placements: Vec<Placement>,
}

/// A parameter managed by a fully sharded unit.
///
/// Its tensor slot in the module tree holds the sharded parameter. Unsharding gathers the
/// shards into the parameter's value before sharding: a plain tensor, or the upstream
/// sharded tensor when the parameter was already sharded.
#[derive(Clone, Debug)]
pub struct FsdpParam {
    tensor: TensorId,
    module_info: ParamModuleInfo,
    param_fqn: Option<String>,
    shard_dim: usize,
    upstream: Option<UpstreamSharding>,
    unsharded: Option<TensorValue>,
}

impl FsdpParam {
    /// Shards the parameter held by `tensor` and assigns the result to its owning attribute.
    ///
    /// The parameter is moved to `device` first, unless it is on the meta device.
    pub fn new(
        tree: &mut ModuleTree,
        tensor: TensorId,
        module_info: ParamModuleInfo,
        mesh_info: &FsdpMeshInfo,
        device: Device,
        shard_dim: usize,
    ) -> Result<Self> {
        let (param, sharded) = Self::shard(tree, tensor, module_info, mesh_info, device, shard_dim)?;
        param.assign(tree, sharded)?;
        Ok(param)
    }

    /// Computes the sharded parameter without touching the module tree.
    ///
    /// [`FsdpParam::assign`] then stores the shard in the owning attribute.
    pub(crate) fn shard(
        tree: &ModuleTree,
        tensor: TensorId,
        module_info: ParamModuleInfo,
        mesh_info: &FsdpMeshInfo,
        device: Device,
        shard_dim: usize,
    ) -> Result<(Self, ShardedTensor)> {
        let (sharded, upstream) = match tree.tensor(tensor) {
            TensorValue::Plain(param) => {
                if param.ndim() == 0 {
                    return Err(FsdpError::ScalarParameter {
                        name: module_info.param_name.clone(),
                    });
                }
                let param = param.to_device(device);
                let sharded =
                    distribute_tensor(&param, mesh_info.mesh(), mesh_info.placements(shard_dim))?;
                (sharded, None)
            }
            TensorValue::Sharded(param) => {
                let (mesh, placements) = compose(mesh_info, param, shard_dim)?;
                let param = param.to_device(device);
                let local = param.to_local();
                if shard_dim >= local.ndim() {
                    return Err(DistributedError::DimOutOfRange {
                        dim: shard_dim,
                        ndim: local.ndim(),
                    }
                    .into());
                }
                let chunk = chunk_range(
                    local.shape()[shard_dim],
                    mesh_info.shard_size(),
                    mesh_info.shard_rank()?,
                );
                let local = local.narrow(shard_dim, chunk.start, chunk.len())?;
                let sharded =
                    ShardedTensor::from_local(local, &mesh, placements, param.shape().to_vec())?;
                let upstream = UpstreamSharding {
                    mesh: param.device_mesh().clone(),
                    placements: param.placements().to_vec(),
                };
                (sharded, Some(upstream))
            }
        };

        log::trace!(
            "sharded {} {:?} into local shard {:?} with {:?}",
            module_info.param_name,
            sharded.shape(),
            sharded.to_local().shape(),
            sharded.placements()
        );
        let param = Self {
            tensor,
            module_info,
            param_fqn: None,
            shard_dim,
            upstream,
            unsharded: None,
        };
        Ok((param, sharded))
    }

    pub(crate) fn assign(&self, tree: &mut ModuleTree, sharded: ShardedTensor) -> Result<()> {
        tree.set_tensor(
            self.module_info.module,
            &self.module_info.param_name,
            TensorValue::Sharded(sharded),
        )
    }

    /// Slot of the sharded parameter.
    pub fn tensor(&self) -> TensorId {
        self.tensor
    }

    /// Owner and aliases in the module tree.
    pub fn module_info(&self) -> &ParamModuleInfo {
        &self.module_info
    }

    /// FQN from the root module, known after lazy initialization.
    pub fn param_fqn(&self) -> Option<&str> {
        self.param_fqn.as_deref()
    }

    pub(crate) fn set_param_fqn(&mut self, fqn: String) {
        self.param_fqn = Some(fqn);
    }

    /// FQN when known, attribute name otherwise.
    pub fn display_name(&self) -> &str {
        self.param_fqn().unwrap_or(&self.module_info.param_name)
    }

    /// Tensor dimension the parameter is sharded along.
    pub fn shard_dim(&self) -> usize {
        self.shard_dim
    }

    /// The sharded parameter.
    pub fn sharded_param<'a>(&self, tree: &'a ModuleTree) -> Result<&'a ShardedTensor> {
        tree.tensor(self.tensor)
            .as_sharded()
            .ok_or_else(|| FsdpError::NotSharded {
                fqn: self.display_name().to_string(),
            })
    }

    /// The gathered value, present between unshard and reshard.
    pub fn unsharded_param(&self) -> Option<&TensorValue> {
        self.unsharded.as_ref()
    }

    /// Gathers the shards along the shard dimension.
    pub fn unshard(
        &mut self,
        tree: &ModuleTree,
        comm: &dyn Collective,
        mesh_info: &FsdpMeshInfo,
    ) -> Result<&TensorValue> {
        let sharded = self.sharded_param(tree)?;
        let shards = comm.all_gather(sharded.to_local(), mesh_info.shard_group()?)?;
        let gathered = Tensor::cat(&shards, self.shard_dim)?;
        let value = match &self.upstream {
            None => TensorValue::Plain(gathered),
            Some(upstream) => TensorValue::Sharded(ShardedTensor::from_local(
                gathered,
                &upstream.mesh,
                upstream.placements.clone(),
                sharded.shape().to_vec(),
            )?),
        };
        Ok(self.unsharded.insert(value))
    }

    /// Drops the gathered value.
    pub fn reshard(&mut self) {
        self.unsharded = None;
    }
}

/// Placements on the shared root mesh for a parameter already sharded by `param`'s mesh.
///
/// The sharding mesh must be 1D and both meshes must be sliced from the same 2D root mesh,
/// with the sharding dimension first.
fn compose(
    mesh_info: &FsdpMeshInfo,
    param: &ShardedTensor,
    shard_dim: usize,
) -> Result<(DeviceMesh, Vec<Placement>)> {
    let dp_mesh = mesh_info.mesh();
    let tp_mesh = param.device_mesh();
    let unsupported = |reason: String| Err(FsdpError::UnsupportedComposition(reason));

    if mesh_info.is_hybrid() {
        return unsupported(format!(
            "hybrid sharding over {} with a parameter sharded over {}",
            dp_mesh, tp_mesh
        ));
    }
    if tp_mesh.ndim() != 1 {
        return unsupported(format!("parameter sharded over the {}D mesh {}", tp_mesh.ndim(), tp_mesh));
    }

    let root = dp_mesh.root_mesh();
    if !dp_mesh.has_root() || !tp_mesh.has_root() || tp_mesh.root_mesh() != root || root.ndim() != 2 {
        return unsupported(format!(
            "{} and {} must be sliced from the same 2D mesh",
            dp_mesh, tp_mesh
        ));
    }

    let dim_of = |mesh: &DeviceMesh| -> Result<usize> {
        let name = mesh
            .dim_names()
            .and_then(|names| names.first())
            .map(|dim| dim.name().to_string())
            .unwrap_or_default();
        Ok(root.dim_index(&name)?)
    };
    if dim_of(dp_mesh)? != 0 || dim_of(tp_mesh)? != 1 {
        return unsupported(format!(
            "the sharding mesh must be the outer dimension of {}",
            root
        ));
    }

    let tp_placement = param.placements()[0];
    let dp_placement = match tp_placement {
        Placement::Shard(dim) if dim == shard_dim => Placement::StridedShard {
            dim: shard_dim,
            split_factor: tp_mesh.size(),
        },
        Placement::Shard(_) | Placement::Replicate => Placement::Shard(shard_dim),
        Placement::StridedShard { .. } => {
            return unsupported(format!("parameter already placed as {}", tp_placement));
        }
    };
    Ok((root.clone(), vec![dp_placement, tp_placement]))
}

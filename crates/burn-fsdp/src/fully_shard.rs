use burn_distributed::Collective;
use burn_distributed::sharding::{DeviceMesh, init_device_mesh};

use crate::managed::{get_managed_modules, get_managed_states};
use crate::param_info::get_param_module_infos;
use crate::state::{lazy_init, validate_materialized};
use crate::{
    FsdpError, FsdpMeshInfo, FsdpParam, FsdpParamGroup, FsdpState, FullyShardConfig, ModuleId,
    ModuleTree, Result, TensorId, TensorValue, UnitId,
};

/// Fully sharded data parallelism for the calling rank.
///
/// Owns the rank's collective and the states of every `fully_shard` call. Wrapping shards
/// the managed parameters in the module tree right away. Coordination between units is
/// deferred to the first [`FullyShard::pre_forward`] on the root.
pub struct FullyShard<C> {
    comm: C,
    states: Vec<FsdpState>,
}

impl<C: Collective> FullyShard<C> {
    /// Creates the context of the rank behind `comm`.
    pub fn new(comm: C) -> Self {
        Self {
            comm,
            states: Vec::new(),
        }
    }

    /// The collective of the calling rank.
    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Shards the parameters managed by `modules` and registers a new unit for them.
    ///
    /// Modules already wrapped by an earlier call are boundaries: their parameters stay
    /// with their unit. Managed parameters are moved to the mesh device and replaced by
    /// sharded parameters. Managed buffers are moved but not sharded. Meta tensors stay
    /// on the meta device.
    pub fn fully_shard(
        &mut self,
        tree: &mut ModuleTree,
        modules: &[ModuleId],
        config: FullyShardConfig,
    ) -> Result<UnitId> {
        let options = config.options().clone();
        let mesh = match config.mesh() {
            Some(mesh) => mesh.clone(),
            None => init_device_mesh(
                &self.comm,
                options.device_type,
                &[self.comm.world_size()],
                None,
            )?,
        };
        let mesh_info = FsdpMeshInfo::new(mesh)?;
        let device = mesh_info.mesh().local_device()?;

        let managed_modules = get_managed_modules(tree, modules);
        let (params, buffers) = get_managed_states(tree, &managed_modules);
        validate_mesh_device_types(tree, mesh_info.mesh(), &params, &buffers)?;

        let infos = get_param_module_infos(tree, &params, modules)?;
        if let Some(info) = infos
            .iter()
            .zip(&params)
            .find(|(_, id)| tree.tensor(**id).ndim() == 0)
            .map(|(info, _)| info)
        {
            return Err(FsdpError::ScalarParameter {
                name: info.param_name.clone(),
            });
        }

        // Every shard is computed before the tree is touched
        let (fsdp_params, shards): (Vec<FsdpParam>, Vec<_>) = params
            .iter()
            .zip(infos)
            .map(|(id, info)| {
                FsdpParam::shard(tree, *id, info, &mesh_info, device, options.shard_dim)
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();

        let meta = params
            .iter()
            .chain(&buffers)
            .filter(|id| tree.tensor(**id).is_meta())
            .count();
        if meta > 0 {
            log::warn!("{meta} managed tensor(s) left on the meta device until materialization");
        }
        for id in &buffers {
            let moved = tree.tensor(*id).to_device(device);
            tree.replace(*id, moved);
        }
        for (param, sharded) in fsdp_params.iter().zip(shards) {
            param.assign(tree, sharded)?;
        }

        log::debug!(
            "fully_shard over {}: {} managed module(s), {} parameter(s), {} buffer(s)",
            mesh_info.mesh(),
            managed_modules.len(),
            fsdp_params.len(),
            buffers.len()
        );

        let param_group = (!fsdp_params.is_empty()).then(|| {
            FsdpParamGroup::new(
                fsdp_params,
                modules.to_vec(),
                mesh_info,
                options.reshard_after_forward,
            )
        });

        let unit = UnitId::new(self.states.len());
        self.states.push(FsdpState::new(modules.to_vec(), param_group));
        for module in modules {
            tree.set_fsdp_state(*module, unit);
        }
        Ok(unit)
    }

    /// Unit wrapping `module`, if any.
    pub fn state_of(&self, tree: &ModuleTree, module: ModuleId) -> Option<UnitId> {
        tree.node(module).fsdp_state()
    }

    /// State of a unit.
    pub fn state(&self, unit: UnitId) -> &FsdpState {
        &self.states[unit.index()]
    }

    /// Lazily initializes `unit` as a root. See [`FsdpState::is_root`].
    pub fn lazy_init(&mut self, tree: &ModuleTree, unit: UnitId) -> Result<()> {
        lazy_init(&mut self.states, tree, unit)
    }

    /// Runs before the forward of `module`: lazy initialization, then unsharding.
    ///
    /// Every call fails while parameters remain on the meta device: through the root,
    /// listing those of the first unit that has any, otherwise listing the unit's own.
    ///
    /// Returns the gathered parameters of the module's unit keyed by FQN.
    pub fn pre_forward(
        &mut self,
        tree: &ModuleTree,
        module: ModuleId,
    ) -> Result<Vec<(String, TensorValue)>> {
        let unit = self.require_state(tree, module)?;
        let state = &self.states[unit.index()];
        if !state.is_initialized() {
            lazy_init(&mut self.states, tree, unit)?;
        } else if state.is_root() == Some(true) {
            validate_materialized(&self.states, tree, unit)?;
        }
        match self.states[unit.index()].param_group_mut() {
            Some(group) => group.unshard(tree, &self.comm),
            None => Ok(Vec::new()),
        }
    }

    /// Runs after the forward of `module`: reshards when configured to.
    pub fn post_forward(&mut self, tree: &ModuleTree, module: ModuleId) -> Result<()> {
        let unit = self.require_state(tree, module)?;
        if let Some(group) = self.states[unit.index()].param_group_mut() {
            if group.reshard_after_forward() {
                group.reshard();
            }
        }
        Ok(())
    }

    /// Sharded state of the tree below `module`, keyed by FQN.
    ///
    /// Parameters are sharded tensors, buffers are plain tensors.
    pub fn state_dict(
        &self,
        tree: &ModuleTree,
        module: ModuleId,
    ) -> Result<Vec<(String, TensorValue)>> {
        self.require_state(tree, module)?;
        Ok(tree.state_dict(module))
    }

    fn require_state(&self, tree: &ModuleTree, module: ModuleId) -> Result<UnitId> {
        self.state_of(tree, module)
            .ok_or_else(|| FsdpError::NotWrapped(tree.node(module).type_name().to_string()))
    }
}

/// Upstream sharded tensors must live on a mesh of the sharding mesh's device type.
fn validate_mesh_device_types(
    tree: &ModuleTree,
    mesh: &DeviceMesh,
    params: &[TensorId],
    buffers: &[TensorId],
) -> Result<()> {
    for id in params.iter().chain(buffers) {
        if let Some(sharded) = tree.tensor(*id).as_sharded() {
            let tensor = sharded.device_mesh().device_type();
            if tensor != mesh.device_type() {
                return Err(FsdpError::MeshDeviceMismatch {
                    tensor,
                    mesh: mesh.device_type(),
                });
            }
        }
    }
    Ok(())
}

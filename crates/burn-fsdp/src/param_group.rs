use burn_distributed::Collective;

use crate::{FsdpError, FsdpMeshInfo, FsdpParam, ModuleId, ModuleTree, Result, TensorValue};

/// The parameters of one fully sharded unit, unsharded and resharded together.
#[derive(Clone, Debug)]
pub struct FsdpParamGroup {
    fsdp_params: Vec<FsdpParam>,
    modules: Vec<ModuleId>,
    mesh_info: FsdpMeshInfo,
    module_fqn: Option<String>,
    reshard_after_forward: bool,
    is_unsharded: bool,
}

impl FsdpParamGroup {
    pub(crate) fn new(
        fsdp_params: Vec<FsdpParam>,
        modules: Vec<ModuleId>,
        mesh_info: FsdpMeshInfo,
        reshard_after_forward: bool,
    ) -> Self {
        Self {
            fsdp_params,
            modules,
            mesh_info,
            module_fqn: None,
            reshard_after_forward,
            is_unsharded: false,
        }
    }

    /// The managed parameters.
    pub fn fsdp_params(&self) -> &[FsdpParam] {
        &self.fsdp_params
    }

    pub(crate) fn fsdp_params_mut(&mut self) -> &mut [FsdpParam] {
        &mut self.fsdp_params
    }

    /// Modules the unit was applied to.
    pub fn modules(&self) -> &[ModuleId] {
        &self.modules
    }

    /// The sharding mesh.
    pub fn mesh_info(&self) -> &FsdpMeshInfo {
        &self.mesh_info
    }

    /// FQN of the unit's modules from the root, comma separated, known after lazy
    /// initialization.
    pub fn module_fqn(&self) -> Option<&str> {
        self.module_fqn.as_deref()
    }

    pub(crate) fn append_module_fqn(&mut self, name: &str) {
        self.module_fqn = Some(match self.module_fqn.take() {
            None => name.to_string(),
            Some(fqn) => format!("{fqn}, {name}"),
        });
    }

    /// Whether parameters are resharded after forward.
    pub fn reshard_after_forward(&self) -> bool {
        self.reshard_after_forward
    }

    /// Whether the parameters are currently gathered.
    pub fn is_unsharded(&self) -> bool {
        self.is_unsharded
    }

    /// Fails when any parameter still lives on the meta device, listing them.
    pub fn validate_no_meta_params(&self, tree: &ModuleTree) -> Result<()> {
        let meta: Vec<String> = self
            .fsdp_params
            .iter()
            .filter(|param| tree.tensor(param.tensor()).is_meta())
            .map(|param| param.display_name().to_string())
            .collect();
        if meta.is_empty() {
            Ok(())
        } else {
            Err(FsdpError::MetaParameters(meta))
        }
    }

    /// Gathers every parameter, returning the unsharded values keyed by FQN.
    ///
    /// Fails when any parameter is still on the meta device.
    pub fn unshard(
        &mut self,
        tree: &ModuleTree,
        comm: &dyn Collective,
    ) -> Result<Vec<(String, TensorValue)>> {
        self.validate_no_meta_params(tree)?;
        let mut unsharded = Vec::with_capacity(self.fsdp_params.len());
        for param in &mut self.fsdp_params {
            let value = param.unshard(tree, comm, &self.mesh_info)?.clone();
            unsharded.push((param.display_name().to_string(), value));
        }
        self.is_unsharded = true;
        log::debug!(
            "unsharded {} parameter(s) of {}",
            unsharded.len(),
            self.module_fqn().unwrap_or("<uninitialized>")
        );
        Ok(unsharded)
    }

    /// Drops every gathered parameter.
    pub fn reshard(&mut self) {
        for param in &mut self.fsdp_params {
            param.reshard();
        }
        if self.is_unsharded {
            log::debug!("resharded {}", self.module_fqn().unwrap_or("<uninitialized>"));
        }
        self.is_unsharded = false;
    }
}

use burn_distributed::distribute_tensor;
use burn_distributed::sharding::{DeviceMesh, Placement};

use crate::{FsdpError, ModuleId, ModuleTree, Result, TensorValue};

/// How a tensor parallel style places the parameters of a linear module.
pub trait ParallelStyle {
    /// Placement over the 1D tensor parallel mesh of the parameter named `param_name`.
    fn placement(&self, param_name: &str) -> Placement;
}

/// Splits the output features: `weight` and `bias` are sharded along dimension 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct ColwiseParallel;

impl ParallelStyle for ColwiseParallel {
    fn placement(&self, _param_name: &str) -> Placement {
        Placement::Shard(0)
    }
}

/// Splits the input features: `weight` is sharded along dimension 1, `bias` is replicated.
#[derive(Clone, Copy, Debug, Default)]
pub struct RowwiseParallel;

impl ParallelStyle for RowwiseParallel {
    fn placement(&self, param_name: &str) -> Placement {
        match param_name {
            "weight" => Placement::Shard(1),
            _ => Placement::Replicate,
        }
    }
}

/// Applies a tensor parallel plan to the submodules of `module`.
///
/// Each plan entry names a submodule by its dotted path from `module`. The submodule's own
/// parameters become sharded tensors over `tp_mesh` on its local device. Buffers are left
/// untouched. Meta parameters stay on the meta device.
pub fn parallelize_module(
    tree: &mut ModuleTree,
    module: ModuleId,
    tp_mesh: &DeviceMesh,
    plan: &[(&str, &dyn ParallelStyle)],
) -> Result<()> {
    if tp_mesh.ndim() != 1 {
        return Err(FsdpError::UnsupportedComposition(format!(
            "tensor parallelism expects a 1D mesh but got {tp_mesh}"
        )));
    }
    let device = tp_mesh.local_device()?;

    for (path, style) in plan {
        let target = tree
            .get_submodule(module, path)
            .ok_or_else(|| FsdpError::UnknownAttribute {
                module: tree.node(module).type_name().to_string(),
                name: path.to_string(),
            })?;
        let parameters = tree.node(target).parameters().to_vec();
        for (name, id) in parameters {
            let TensorValue::Plain(param) = tree.tensor(id) else {
                continue;
            };
            let placement = style.placement(&name);
            let sharded = distribute_tensor(param, tp_mesh, vec![placement])?.to_device(device);
            tree.set_tensor(target, &name, TensorValue::Sharded(sharded))?;
        }
        log::debug!("parallelized {path} over {tp_mesh}");
    }
    Ok(())
}

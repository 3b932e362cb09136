use burn_distributed::sharding::DeviceMesh;
use burn_distributed::{Collective, ProcessGroup, get_process_group_ranks};

use crate::{ModuleId, ModuleTree, Result, TensorId};

/// Marks `module` as replicated without touching its tensors.
///
/// Replicated modules stay visible to `fully_shard`: a later call on an ancestor manages
/// their tensors.
pub fn mark_replicated(tree: &mut ModuleTree, module: ModuleId) {
    tree.set_replicated(module);
    log::debug!("marked {} as replicated", tree.node(module).type_name());
}

/// Replicates `module` over the whole world.
///
/// Marks the module, then broadcasts its parameters and buffers from rank 0 so that every
/// rank starts from the same values.
pub fn replicate(tree: &mut ModuleTree, comm: &dyn Collective, module: ModuleId) -> Result<()> {
    mark_replicated(tree, module);
    let group = comm.world_group();
    let tensors = states_of(tree, module);
    broadcast_tensors(tree, comm, &tensors, 0, &group)?;
    log::debug!(
        "replicated {} tensor(s) of {} from rank 0",
        tensors.len(),
        tree.node(module).type_name()
    );
    Ok(())
}

/// Makes every replica of the tensors below `root` identical to the first replica.
///
/// The replica group is the mesh dimension named `replicate`, or dimension 0 of a 2D
/// mesh. Within the caller's replica group the first rank is the source; each local
/// shard is broadcast from it, so ranks holding different shards stay independent. A 1D
/// mesh without a `replicate` dimension has no replicas and nothing is sent.
pub fn broadcast_across_replicas(
    tree: &mut ModuleTree,
    comm: &dyn Collective,
    root: ModuleId,
    mesh: &DeviceMesh,
) -> Result<()> {
    let group = match mesh.get_group_by_name("replicate") {
        Ok(group) => group,
        Err(_) if mesh.ndim() == 2 => mesh.get_group(0)?,
        Err(_) => {
            log::debug!("{mesh} has no replicate dimension, skipping replica broadcast");
            return Ok(());
        }
    };
    let Some(&src) = get_process_group_ranks(group).first() else {
        return Ok(());
    };
    let tensors = states_of(tree, root);
    broadcast_tensors(tree, comm, &tensors, src, group)?;
    log::debug!(
        "broadcast {} tensor(s) from rank {src} across replicas {:?}",
        tensors.len(),
        group.ranks()
    );
    Ok(())
}

fn states_of(tree: &ModuleTree, root: ModuleId) -> Vec<TensorId> {
    tree.parameters(root)
        .into_iter()
        .chain(tree.buffers(root))
        .collect()
}

fn broadcast_tensors(
    tree: &mut ModuleTree,
    comm: &dyn Collective,
    tensors: &[TensorId],
    src: usize,
    group: &ProcessGroup,
) -> Result<()> {
    for id in tensors {
        let received = comm.broadcast(tree.tensor(*id).local(), src, group)?;
        *tree.tensor_mut(*id).local_mut() = received;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::MlpConfig;
    use burn_distributed::sharding::{DeviceMeshBuilder, MeshDim, init_device_mesh};
    use burn_distributed::{Device, DeviceType, InProcessWorld, Tensor};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_replicate_broadcasts_from_rank_zero() {
        let comms = InProcessWorld::new(2);
        std::thread::scope(|scope| {
            for comm in &comms {
                scope.spawn(move || {
                    let mut tree = ModuleTree::new();
                    let mut rng = StdRng::seed_from_u64(comm.rank() as u64);
                    let mlp = MlpConfig::new(4)
                        .with_buffer(true)
                        .init(&mut tree, Device::Cpu, &mut rng);

                    replicate(&mut tree, comm, mlp).unwrap();

                    assert!(tree.node(mlp).is_replicated());
                    let mut reference = ModuleTree::new();
                    let expected = MlpConfig::new(4).with_buffer(true).init(
                        &mut reference,
                        Device::Cpu,
                        &mut StdRng::seed_from_u64(0),
                    );
                    assert_eq!(tree.state_dict(mlp), reference.state_dict(expected));
                });
            }
        });
    }

    #[test]
    fn test_broadcast_source_is_first_rank_of_group() {
        // Replica groups are [2, 0] and [3, 1]
        let comms = InProcessWorld::new(4);
        std::thread::scope(|scope| {
            for comm in &comms {
                scope.spawn(move || {
                    let mesh = DeviceMeshBuilder::new(DeviceType::Cpu, vec![2, 3, 0, 1], [2, 2])
                        .with_dim(0, MeshDim::new("replicate"))
                        .with_dim(1, MeshDim::new("shard"))
                        .build(comm)
                        .unwrap();
                    let mut tree = ModuleTree::new();
                    let module = tree.add_module("Linear");
                    let value = Tensor::full(&[2], comm.rank() as f32, Device::Cpu);
                    let id = tree.register_parameter(module, "weight", value);

                    broadcast_across_replicas(&mut tree, comm, module, &mesh).unwrap();

                    let expected = if comm.rank() % 2 == 0 { 2.0 } else { 3.0 };
                    assert_eq!(tree.tensor(id).local().to_vec().unwrap(), vec![expected; 2]);
                });
            }
        });
    }

    #[test]
    fn test_broadcast_skips_1d_mesh() {
        let comms = InProcessWorld::new(1);
        let mesh = init_device_mesh(&comms[0], DeviceType::Cpu, &[1], None).unwrap();
        let mut tree = ModuleTree::new();
        let module = tree.add_module("Linear");
        tree.register_parameter(module, "weight", Tensor::meta(&[2]));

        broadcast_across_replicas(&mut tree, &comms[0], module, &mesh).unwrap();
        assert!(tree.tensor(tree.parameters(module)[0]).is_meta());
    }
}

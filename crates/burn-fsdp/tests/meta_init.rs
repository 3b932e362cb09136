//! Wrapping modules whose tensors live on the meta device, then materializing them.

mod common;

use burn_distributed::sharding::{DeviceMesh, init_device_mesh};
use burn_distributed::{Collective, Device, DeviceType, Tensor, distribute_tensor};
use burn_fsdp::nn::MlpConfig;
use burn_fsdp::{
    ColwiseParallel, FullyShard, FullyShardConfig, ModuleId, ModuleTree, RowwiseParallel,
    TensorValue, parallelize_module, replicate,
};
use common::{mlp_sequential, run_world, submodule};
use rand::SeedableRng;
use rand::rngs::StdRng;

const CONST: f32 = 1337.0;

fn assert_all_meta(tree: &ModuleTree, root: ModuleId) {
    for id in tree.parameters(root) {
        assert_eq!(tree.tensor(id).device(), Device::Meta);
    }
}

/// Materializes `root`, then checks that resetting overwrites every tensor and that the
/// units can run a forward.
fn check_to_empty_and_reset_parameters<C: Collective>(
    fsdp: &mut FullyShard<C>,
    tree: &mut ModuleTree,
    root: ModuleId,
    units: &[ModuleId],
    mesh: &DeviceMesh,
) {
    let device = mesh.local_device().unwrap();
    tree.to_empty(root, device);
    for id in tree.parameters(root) {
        assert_eq!(tree.tensor(id).device(), device);
    }

    let ids: Vec<_> = tree
        .parameters(root)
        .into_iter()
        .chain(tree.buffers(root))
        .collect();
    for id in &ids {
        tree.tensor_mut(*id).local_mut().fill_(CONST);
    }
    tree.reset_parameters(root, &mut StdRng::seed_from_u64(0));
    for id in &ids {
        let local = tree.tensor(*id).local();
        if local.numel() > 0 {
            assert_ne!(local.to_vec().unwrap(), vec![CONST; local.numel()]);
        }
    }

    for unit in units {
        fsdp.pre_forward(tree, *unit).unwrap();
    }
    for unit in units.iter().rev() {
        fsdp.post_forward(tree, *unit).unwrap();
    }
}

#[test]
fn test_meta_device_1d_init() {
    run_world(4, |comm| {
        let mesh = init_device_mesh(&comm, DeviceType::Cuda, &[4], None).unwrap();
        let mut fsdp = FullyShard::new(comm);

        // Even (8) and uneven (3) sharding
        for mlp_dim in [8, 3] {
            let mut tree = ModuleTree::new();
            let mut rng = StdRng::seed_from_u64(0);
            let mlp0 = MlpConfig::new(mlp_dim)
                .with_buffer(true)
                .init(&mut tree, Device::Meta, &mut rng);
            let mlp1 = MlpConfig::new(mlp_dim).init(&mut tree, Device::Meta, &mut rng);
            let model = burn_fsdp::nn::sequential(&mut tree, &[mlp0, mlp1]);
            assert_all_meta(&tree, model);

            for module in [mlp0, mlp1, model] {
                let config = FullyShardConfig::new().with_mesh(mesh.clone());
                fsdp.fully_shard(&mut tree, &[module], config).unwrap();
            }
            assert_all_meta(&tree, model);
            check_to_empty_and_reset_parameters(&mut fsdp, &mut tree, model, &[model, mlp0, mlp1], &mesh);
        }

        // Without an explicit mesh
        let mut tree = ModuleTree::new();
        let mut rng = StdRng::seed_from_u64(0);
        let mlp0 = MlpConfig::new(8)
            .with_buffer(true)
            .init(&mut tree, Device::Meta, &mut rng);
        let mlp1 = MlpConfig::new(8).init(&mut tree, Device::Meta, &mut rng);
        let model = burn_fsdp::nn::sequential(&mut tree, &[mlp0, mlp1]);
        for module in [mlp0, mlp1, model] {
            fsdp.fully_shard(&mut tree, &[module], FullyShardConfig::new())
                .unwrap();
        }
        assert_all_meta(&tree, model);
        check_to_empty_and_reset_parameters(&mut fsdp, &mut tree, model, &[model, mlp0, mlp1], &mesh);
    });
}

#[test]
fn test_meta_device_2d_init() {
    run_world(4, |comm| {
        let global_mesh =
            init_device_mesh(&comm, DeviceType::Cuda, &[2, 2], Some(&["dp", "tp"])).unwrap();
        let dp_mesh = global_mesh.slice("dp").unwrap();
        let tp_mesh = global_mesh.slice("tp").unwrap();
        let mut fsdp = FullyShard::new(comm);

        for mlp_dim in [8, 3] {
            let mut tree = ModuleTree::new();
            let model = MlpConfig::new(mlp_dim).with_buffer(true).init(
                &mut tree,
                Device::Meta,
                &mut StdRng::seed_from_u64(0),
            );
            assert_all_meta(&tree, model);
            parallelize_module(
                &mut tree,
                model,
                &tp_mesh,
                &[("in_proj", &ColwiseParallel), ("out_proj", &RowwiseParallel)],
            )
            .unwrap();
            assert_all_meta(&tree, model);

            let in_proj = submodule(&tree, model, "in_proj");
            let out_proj = submodule(&tree, model, "out_proj");
            for module in [in_proj, out_proj, model] {
                let config = FullyShardConfig::new().with_mesh(dp_mesh.clone());
                fsdp.fully_shard(&mut tree, &[module], config).unwrap();
            }
            assert_all_meta(&tree, model);
            check_to_empty_and_reset_parameters(
                &mut fsdp,
                &mut tree,
                model,
                &[model, in_proj, out_proj],
                &global_mesh,
            );
        }
    });
}

#[test]
fn test_invalid_meta_device_init() {
    run_world(4, |comm| {
        let mesh = init_device_mesh(&comm, DeviceType::Cuda, &[4], None).unwrap();
        let mut fsdp = FullyShard::new(comm);
        let mut tree = ModuleTree::new();
        let mut rng = StdRng::seed_from_u64(0);
        let mlp0 = MlpConfig::new(8)
            .with_buffer(true)
            .init(&mut tree, Device::Meta, &mut rng);
        let mlp1 = MlpConfig::new(8).init(&mut tree, Device::Meta, &mut rng);
        let model = burn_fsdp::nn::sequential(&mut tree, &[mlp0, mlp1]);
        for module in [mlp0, mlp1, model] {
            let config = FullyShardConfig::new().with_mesh(mesh.clone());
            fsdp.fully_shard(&mut tree, &[module], config).unwrap();
        }

        let expected = "FSDP parameters should be materialized from meta device before training, \
             but the following were still on meta device: \
             ['0.in_proj.weight', '0.in_proj.bias', '0.out_proj.weight', '0.out_proj.bias']";
        let err = fsdp.pre_forward(&tree, model).unwrap_err();
        assert_eq!(err.to_string(), expected);

        // Later forwards keep failing until the model is materialized
        let err = fsdp.pre_forward(&tree, model).unwrap_err();
        assert_eq!(err.to_string(), expected);
        let err = fsdp.pre_forward(&tree, mlp1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "FSDP parameters should be materialized from meta device before training, \
             but the following were still on meta device: \
             ['1.in_proj.weight', '1.in_proj.bias', '1.out_proj.weight', '1.out_proj.bias']"
        );

        tree.to_empty(model, mesh.local_device().unwrap());
        tree.reset_parameters(model, &mut StdRng::seed_from_u64(0));
        fsdp.pre_forward(&tree, model).unwrap();
        fsdp.pre_forward(&tree, mlp1).unwrap();
    });
}

/// `Sequential` of two perceptrons, each wrapped, then the root.
fn wrapped_model<C: Collective>(
    fsdp: &mut FullyShard<C>,
    tree: &mut ModuleTree,
    device: Device,
    seed: u64,
    mesh: &DeviceMesh,
) -> (ModuleId, Vec<ModuleId>) {
    let (model, mlps) = mlp_sequential(tree, 2, &MlpConfig::new(8).with_buffer(true), device, seed);
    for module in mlps.iter().chain([&model]) {
        let config = FullyShardConfig::new().with_mesh(mesh.clone());
        fsdp.fully_shard(tree, &[*module], config).unwrap();
    }
    (model, mlps)
}

#[test]
fn test_rank0_broadcast_meta_device_init() {
    run_world(4, |comm| {
        let rank = comm.rank();
        let device = Device::Cuda(rank);
        let mesh = init_device_mesh(&comm, DeviceType::Cuda, &[4], None).unwrap();

        // Full state dict on rank 0 only
        let full_sd = (rank == 0).then(|| {
            let mut ref_tree = ModuleTree::new();
            let (ref_model, _) =
                mlp_sequential(&mut ref_tree, 2, &MlpConfig::new(8).with_buffer(true), Device::Cpu, 42);
            ref_tree.state_dict(ref_model)
        });

        let mut fsdp = FullyShard::new(comm);
        let mut tree = ModuleTree::new();
        let (model, _) = wrapped_model(&mut fsdp, &mut tree, Device::Meta, 0, &mesh);
        assert_all_meta(&tree, model);

        // Broadcast every full tensor from rank 0, then shard it like its meta counterpart
        let meta_sd = fsdp.state_dict(&tree, model).unwrap();
        if let Some(full_sd) = &full_sd {
            let names: Vec<&String> = full_sd.iter().map(|(name, _)| name).collect();
            let meta_names: Vec<&String> = meta_sd.iter().map(|(name, _)| name).collect();
            assert_eq!(names, meta_names);
        }
        let mut sharded_sd = Vec::with_capacity(meta_sd.len());
        for (index, (name, meta)) in meta_sd.iter().enumerate() {
            let full = match &full_sd {
                Some(full_sd) => full_sd[index].1.local().to_device(device),
                None => Tensor::zeros(meta.shape(), device),
            };
            let value = match meta {
                TensorValue::Sharded(meta) => {
                    let mesh = meta.device_mesh();
                    let full = fsdp
                        .comm()
                        .broadcast(&full, 0, mesh.get_group(0).unwrap())
                        .unwrap();
                    TensorValue::Sharded(
                        distribute_tensor(&full, mesh, meta.placements().to_vec()).unwrap(),
                    )
                }
                TensorValue::Plain(_) => {
                    let group = fsdp.comm().world_group();
                    TensorValue::Plain(fsdp.comm().broadcast(&full, 0, &group).unwrap())
                }
            };
            sharded_sd.push((name.clone(), value));
        }
        tree.load_state_dict(model, sharded_sd).unwrap();
        for id in tree.parameters(model) {
            let param = tree.tensor(id);
            assert!(param.as_sharded().is_some());
            assert_eq!(param.device(), device);
        }

        // Reference: rank 0's model replicated to every rank, then sharded
        let mut ref_tree = ModuleTree::new();
        let seed = if rank == 0 { 42 } else { 7 };
        let (ref_model, _) =
            mlp_sequential(&mut ref_tree, 2, &MlpConfig::new(8).with_buffer(true), Device::Cpu, seed);
        replicate(&mut ref_tree, fsdp.comm(), ref_model).unwrap();
        let ref_mlps: Vec<ModuleId> = ["0", "1"]
            .iter()
            .map(|path| submodule(&ref_tree, ref_model, path))
            .collect();
        for module in ref_mlps.iter().chain([&ref_model]) {
            let config = FullyShardConfig::new().with_mesh(mesh.clone());
            fsdp.fully_shard(&mut ref_tree, &[*module], config).unwrap();
        }

        assert_eq!(
            fsdp.state_dict(&tree, model).unwrap(),
            fsdp.state_dict(&ref_tree, ref_model).unwrap()
        );

        // Forward parity
        let mlp0 = submodule(&tree, model, "0");
        let ref_mlp0 = submodule(&ref_tree, ref_model, "0");
        fsdp.pre_forward(&tree, model).unwrap();
        fsdp.pre_forward(&ref_tree, ref_model).unwrap();
        assert_eq!(
            fsdp.pre_forward(&tree, mlp0).unwrap(),
            fsdp.pre_forward(&ref_tree, ref_mlp0).unwrap()
        );
    });
}

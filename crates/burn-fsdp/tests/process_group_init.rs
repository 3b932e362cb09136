//! Sharding over meshes built from existing process groups.

mod common;

use burn_distributed::sharding::{DeviceMesh, init_device_mesh};
use burn_distributed::{Collective, Device, DeviceType, get_process_group_ranks};
use burn_fsdp::nn::MlpConfig;
use burn_fsdp::{FullyShard, FullyShardConfig, ModuleId, ModuleTree};
use common::{run_world, submodule};
use ndarray::{ArrayD, IxDyn};
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Wraps `in_proj`, `out_proj` then the perceptron itself over `mesh`.
fn wrap_mlp<C: Collective>(
    fsdp: &mut FullyShard<C>,
    tree: &mut ModuleTree,
    mesh: &DeviceMesh,
) -> ModuleId {
    let mlp = MlpConfig::new(8).init(tree, Device::Cpu, &mut StdRng::seed_from_u64(42));
    let in_proj = submodule(tree, mlp, "in_proj");
    let out_proj = submodule(tree, mlp, "out_proj");
    for module in [in_proj, out_proj, mlp] {
        let config = FullyShardConfig::new().with_mesh(mesh.clone());
        fsdp.fully_shard(tree, &[module], config).unwrap();
    }
    mlp
}

/// Compares the sharded parameters, then the gathered parameters of every unit.
fn check_parity<C: Collective>(
    fsdp: &mut FullyShard<C>,
    tree: &ModuleTree,
    mlp: ModuleId,
    ref_tree: &ModuleTree,
    ref_mlp: ModuleId,
) {
    let params = tree.parameters(mlp);
    let ref_params = ref_tree.parameters(ref_mlp);
    assert_eq!(params.len(), ref_params.len());
    for (id, ref_id) in params.iter().zip(&ref_params) {
        let param = tree.tensor(*id).as_sharded().unwrap();
        let ref_param = ref_tree.tensor(*ref_id).as_sharded().unwrap();
        assert_eq!(param.to_local(), ref_param.to_local());
        assert_eq!(param.device_mesh().mesh(), ref_param.device_mesh().mesh());
    }

    for path in ["", "in_proj", "out_proj"] {
        let unit = submodule(tree, mlp, path);
        let ref_unit = submodule(ref_tree, ref_mlp, path);
        assert_eq!(
            fsdp.pre_forward(tree, unit).unwrap(),
            fsdp.pre_forward(ref_tree, ref_unit).unwrap()
        );
    }
}

#[test]
fn test_1d_process_group_init() {
    run_world(4, |comm| {
        let global_mesh =
            init_device_mesh(&comm, DeviceType::Cuda, &[2, 2], Some(&["dp", "tp"])).unwrap();
        let ref_dp_mesh = global_mesh.slice("dp").unwrap();
        let dp_group = ref_dp_mesh.get_group(0).unwrap().clone();

        let dp_mesh =
            DeviceMesh::from_group(&comm, &[dp_group], DeviceType::Cuda, Some(&["dp"]), None)
                .unwrap();
        assert_eq!(dp_mesh.mesh(), ref_dp_mesh.mesh());
        assert_eq!(dp_mesh.coordinate(), ref_dp_mesh.coordinate());
        assert_eq!(dp_mesh.dim_groups(), ref_dp_mesh.dim_groups());
        // Only the sliced mesh remembers its root
        assert!(ref_dp_mesh.has_root());
        assert!(!dp_mesh.has_root());

        let mut fsdp = FullyShard::new(comm);
        let mut ref_tree = ModuleTree::new();
        let ref_mlp = wrap_mlp(&mut fsdp, &mut ref_tree, &ref_dp_mesh);
        let mut tree = ModuleTree::new();
        let mlp = wrap_mlp(&mut fsdp, &mut tree, &dp_mesh);

        check_parity(&mut fsdp, &tree, mlp, &ref_tree, ref_mlp);
    });
}

#[test]
fn test_2d_process_group_init() {
    run_world(4, |comm| {
        let (replicate_size, shard_size) = (2, 2);
        let names = ["replicate", "shard"];
        let ref_mesh = init_device_mesh(
            &comm,
            DeviceType::Cuda,
            &[replicate_size, shard_size],
            Some(&names),
        )
        .unwrap();

        // Intra-node shard groups and inter-node replicate groups
        let rank = comm.rank();
        let shard_group = comm
            .new_group((0..shard_size).map(|i| rank / shard_size * shard_size + i).collect())
            .unwrap();
        let replicate_group = comm
            .new_group((0..replicate_size).map(|i| rank % shard_size + i * shard_size).collect())
            .unwrap();
        let world = comm.world_group();
        let ranks = ArrayD::from_shape_vec(
            IxDyn(&[replicate_size, shard_size]),
            get_process_group_ranks(&world).to_vec(),
        )
        .unwrap();

        let mesh = DeviceMesh::from_group(
            &comm,
            &[replicate_group, shard_group],
            DeviceType::Cuda,
            Some(&names),
            Some(ranks),
        )
        .unwrap();
        assert_eq!(mesh.mesh(), ref_mesh.mesh());
        assert_eq!(mesh.coordinate(), ref_mesh.coordinate());
        for (group, ref_group) in mesh.dim_groups().iter().zip(ref_mesh.dim_groups()) {
            assert_eq!(group.ranks(), ref_group.ranks());
        }
        for name in names {
            let child = mesh.slice(name).unwrap();
            let ref_child = ref_mesh.slice(name).unwrap();
            assert_eq!(child, ref_child);
            assert_eq!(
                get_process_group_ranks(child.get_group(0).unwrap()),
                get_process_group_ranks(ref_child.get_group(0).unwrap())
            );
        }

        let mut fsdp = FullyShard::new(comm);
        let mut ref_tree = ModuleTree::new();
        let ref_mlp = wrap_mlp(&mut fsdp, &mut ref_tree, &ref_mesh);
        let mut tree = ModuleTree::new();
        let mlp = wrap_mlp(&mut fsdp, &mut tree, &mesh);

        for (id, ref_id) in tree.parameters(mlp).iter().zip(ref_tree.parameters(ref_mlp)) {
            assert_eq!(tree.tensor(*id), ref_tree.tensor(ref_id));
        }
        check_parity(&mut fsdp, &tree, mlp, &ref_tree, ref_mlp);
    });
}

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use burn_distributed::{Device, InProcessCollective, InProcessWorld};
use burn_fsdp::nn::{MlpConfig, sequential};
use burn_fsdp::{ModuleId, ModuleTree};
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Runs `f` once per rank, each rank on its own thread, and returns the results by rank.
pub fn run_world<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(InProcessCollective) -> T + Sync,
{
    let comms = InProcessWorld::new(world_size);
    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| scope.spawn(|| f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    })
}

/// A `Sequential` of `count` perceptrons built from `config`, seeded identically on every rank.
pub fn mlp_sequential(
    tree: &mut ModuleTree,
    count: usize,
    config: &MlpConfig,
    device: Device,
    seed: u64,
) -> (ModuleId, Vec<ModuleId>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mlps: Vec<ModuleId> = (0..count)
        .map(|_| config.init(tree, device, &mut rng))
        .collect();
    (sequential(tree, &mlps), mlps)
}

/// Submodule at a dotted path, panicking when absent.
pub fn submodule(tree: &ModuleTree, root: ModuleId, path: &str) -> ModuleId {
    tree.get_submodule(root, path)
        .unwrap_or_else(|| panic!("no submodule at {path}"))
}

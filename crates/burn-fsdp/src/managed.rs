use hashbrown::HashSet;

use crate::{ModuleId, ModuleTree, TensorId};

/// Modules managed by a `fully_shard` call on `roots`.
///
/// Traverses each root depth-first and returns the modules in post-order, each module
/// once. A module already wrapped by another unit is a boundary: neither it nor its
/// descendants are managed, unless it is one of the roots. Modules marked with
/// `replicate` are not a boundary.
pub fn get_managed_modules(tree: &ModuleTree, roots: &[ModuleId]) -> Vec<ModuleId> {
    let root_set: HashSet<ModuleId> = roots.iter().copied().collect();
    let mut visited = HashSet::new();
    let mut modules = Vec::new();

    fn dfs(
        tree: &ModuleTree,
        module: ModuleId,
        root_set: &HashSet<ModuleId>,
        visited: &mut HashSet<ModuleId>,
        modules: &mut Vec<ModuleId>,
    ) {
        if !root_set.contains(&module) && tree.node(module).fsdp_state().is_some() {
            return;
        }
        visited.insert(module);
        for (_, child) in tree.node(module).children() {
            if !visited.contains(child) {
                dfs(tree, *child, root_set, visited, modules);
            }
        }
        modules.push(module);
    }

    for root in roots {
        if !visited.contains(root) {
            dfs(tree, *root, &root_set, &mut visited, &mut modules);
        }
    }
    modules
}

/// Parameters and buffers directly held by `modules`, each tensor once, in module order.
pub fn get_managed_states(
    tree: &ModuleTree,
    modules: &[ModuleId],
) -> (Vec<TensorId>, Vec<TensorId>) {
    let mut seen = HashSet::new();
    let mut params = Vec::new();
    let mut buffers = Vec::new();
    for module in modules {
        let node = tree.node(*module);
        for (_, id) in node.parameters() {
            if seen.insert(*id) {
                params.push(*id);
            }
        }
        for (_, id) in node.buffers() {
            if seen.insert(*id) {
                buffers.push(*id);
            }
        }
    }
    (params, buffers)
}

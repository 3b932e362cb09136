use hashbrown::{HashMap, HashSet};

use crate::{FsdpError, FsdpParamGroup, ModuleId, ModuleTree, Result, TensorId};

/// Identity of a fully sharded unit.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnitId(usize);

impl UnitId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub(crate) fn index(&self) -> usize {
        self.0
    }
}

/// State of one `fully_shard` call.
///
/// Created uninitialized at wrap time. Lazy initialization decides whether the unit is
/// the root and, for the root, records every unit of the tree in discovery order.
#[derive(Clone, Debug)]
pub struct FsdpState {
    modules: Vec<ModuleId>,
    param_group: Option<FsdpParamGroup>,
    is_root: Option<bool>,
    module_fqn: Option<String>,
    all_states: Vec<UnitId>,
}

impl FsdpState {
    pub(crate) fn new(modules: Vec<ModuleId>, param_group: Option<FsdpParamGroup>) -> Self {
        Self {
            modules,
            param_group,
            is_root: None,
            module_fqn: None,
            all_states: Vec::new(),
        }
    }

    /// Modules the unit was applied to.
    pub fn modules(&self) -> &[ModuleId] {
        &self.modules
    }

    /// The unit's parameters, `None` when it manages none.
    pub fn param_group(&self) -> Option<&FsdpParamGroup> {
        self.param_group.as_ref()
    }

    pub(crate) fn param_group_mut(&mut self) -> Option<&mut FsdpParamGroup> {
        self.param_group.as_mut()
    }

    /// `None` before lazy initialization, then whether the unit is the root.
    pub fn is_root(&self) -> Option<bool> {
        self.is_root
    }

    /// Whether lazy initialization has reached this unit.
    pub fn is_initialized(&self) -> bool {
        self.is_root.is_some()
    }

    /// FQN of the unit's modules from the root, comma separated, known after lazy
    /// initialization. The root's is empty.
    pub fn module_fqn(&self) -> Option<&str> {
        self.module_fqn.as_deref()
    }

    /// Every unit of the tree, root first, in discovery order. Empty unless root.
    pub fn all_states(&self) -> &[UnitId] {
        &self.all_states
    }
}

/// Initializes `unit` as the root of the units reachable from its module.
///
/// A no-op when `unit` is already initialized. Every other unit reached becomes a
/// non-root; reaching one that is already initialized is an error. Parameter and module
/// FQNs are then computed from the root, and every parameter must be materialized.
pub(crate) fn lazy_init(states: &mut [FsdpState], tree: &ModuleTree, unit: UnitId) -> Result<()> {
    if states[unit.0].is_initialized() {
        return Ok(());
    }

    let root_module = match states[unit.0].modules.as_slice() {
        [module] => *module,
        modules => {
            let names: Vec<String> = modules
                .iter()
                .map(|module| format!("{} ({module})", tree.node(*module).type_name()))
                .collect();
            return Err(FsdpError::MultipleRoots {
                modules: format!("[{}]", names.join(", ")),
            });
        }
    };

    let mut visited = HashSet::new();
    let mut all_states = Vec::new();
    for (module_name, module) in tree.named_modules(root_module) {
        let Some(state) = tree.node(module).fsdp_state() else {
            continue;
        };
        if module != root_module {
            if !visited.contains(&state) && states[state.0].is_initialized() {
                return Err(FsdpError::AlreadyLazilyInitialized {
                    module_fqn: module_name,
                });
            }
            states[state.0].is_root = Some(false);
        }
        if visited.insert(state) {
            all_states.push(state);
        }
    }

    let root = &mut states[unit.0];
    root.is_root = Some(true);
    root.all_states = all_states.clone();
    log::debug!(
        "lazily initialized root {} with {} state(s)",
        tree.node(root_module).type_name(),
        all_states.len()
    );

    init_fqns(states, tree, root_module, &all_states);
    validate_materialized(states, tree, unit)
}

/// Fails when a unit below the root `unit` still has parameters on the meta device.
///
/// Units are checked in discovery order and the first offending one is reported.
pub(crate) fn validate_materialized(states: &[FsdpState], tree: &ModuleTree, unit: UnitId) -> Result<()> {
    for state in &states[unit.0].all_states {
        if let Some(group) = &states[state.0].param_group {
            group.validate_no_meta_params(tree)?;
        }
    }
    Ok(())
}

fn init_fqns(states: &mut [FsdpState], tree: &ModuleTree, root_module: ModuleId, all_states: &[UnitId]) {
    let mut param_owner: HashMap<TensorId, (UnitId, usize)> = HashMap::new();
    let mut module_owner: HashMap<ModuleId, UnitId> = HashMap::new();
    for state in all_states {
        if let Some(group) = &states[state.0].param_group {
            for (index, param) in group.fsdp_params().iter().enumerate() {
                param_owner.insert(param.tensor(), (*state, index));
            }
            for module in group.modules() {
                module_owner.insert(*module, *state);
            }
        }
    }

    for (param_name, id) in tree.named_parameters(root_module) {
        if let Some((state, index)) = param_owner.get(&id) {
            if let Some(group) = states[state.0].param_group_mut() {
                group.fsdp_params_mut()[*index].set_param_fqn(param_name);
            }
        }
    }
    for (module_name, module) in tree.named_modules(root_module) {
        if let Some(state) = module_owner.get(&module) {
            if let Some(group) = states[state.0].param_group_mut() {
                group.append_module_fqn(&module_name);
            }
        }
        if let Some(state) = tree.node(module).fsdp_state() {
            if all_states.contains(&state) && states[state.0].modules.contains(&module) {
                let state = &mut states[state.0];
                state.module_fqn = Some(match state.module_fqn.take() {
                    None => module_name,
                    Some(fqn) => format!("{fqn}, {module_name}"),
                });
            }
        }
    }
}

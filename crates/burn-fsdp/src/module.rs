use core::fmt;

use burn_distributed::{Device, ShardedTensor, Tensor};
use hashbrown::{HashMap, HashSet};
use rand::Rng;

use crate::state::UnitId;
use crate::{FsdpError, Result};

/// Identity of a module in a [`ModuleTree`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModuleId(usize);

/// Identity of a tensor in a [`ModuleTree`].
///
/// Two attributes hold the same tensor exactly when they hold the same id.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TensorId(usize);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor#{}", self.0)
    }
}

/// Whether a tensor attribute is trained or only carried along.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorKind {
    /// A trainable parameter.
    Parameter,
    /// A non-trainable buffer.
    Buffer,
}

/// Value of a tensor attribute: a plain tensor or a sharded one.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorValue {
    /// A tensor fully held by the calling rank.
    Plain(Tensor),
    /// A tensor distributed over a device mesh.
    Sharded(ShardedTensor),
}

impl TensorValue {
    /// Global shape.
    pub fn shape(&self) -> &[usize] {
        match self {
            TensorValue::Plain(tensor) => tensor.shape(),
            TensorValue::Sharded(tensor) => tensor.shape(),
        }
    }

    /// Global number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Tensor held by the calling rank.
    pub fn local(&self) -> &Tensor {
        match self {
            TensorValue::Plain(tensor) => tensor,
            TensorValue::Sharded(tensor) => tensor.to_local(),
        }
    }

    /// Tensor held by the calling rank, mutably.
    pub fn local_mut(&mut self) -> &mut Tensor {
        match self {
            TensorValue::Plain(tensor) => tensor,
            TensorValue::Sharded(tensor) => tensor.local_mut(),
        }
    }

    /// Device of the local tensor.
    pub fn device(&self) -> Device {
        self.local().device()
    }

    /// Whether the local tensor lives on the meta device.
    pub fn is_meta(&self) -> bool {
        self.local().is_meta()
    }

    /// The sharded tensor, if any.
    pub fn as_sharded(&self) -> Option<&ShardedTensor> {
        match self {
            TensorValue::Sharded(tensor) => Some(tensor),
            TensorValue::Plain(_) => None,
        }
    }

    /// Moves the local tensor to `device`. Meta tensors stay meta.
    pub fn to_device(&self, device: Device) -> Self {
        match self {
            TensorValue::Plain(tensor) => TensorValue::Plain(tensor.to_device(device)),
            TensorValue::Sharded(tensor) => TensorValue::Sharded(tensor.to_device(device)),
        }
    }

    /// Allocates storage for a meta local tensor.
    pub fn to_empty(&self, device: Device) -> Self {
        match self {
            TensorValue::Plain(tensor) => TensorValue::Plain(tensor.to_empty(device)),
            TensorValue::Sharded(tensor) => TensorValue::Sharded(tensor.to_empty(device)),
        }
    }
}

impl From<Tensor> for TensorValue {
    fn from(tensor: Tensor) -> Self {
        TensorValue::Plain(tensor)
    }
}

impl From<ShardedTensor> for TensorValue {
    fn from(tensor: ShardedTensor) -> Self {
        TensorValue::Sharded(tensor)
    }
}

#[derive(Clone, Debug)]
struct Slot {
    value: TensorValue,
    kind: TensorKind,
}

/// A module of a [`ModuleTree`]: named children and named tensor attributes.
#[derive(Clone, Debug)]
pub struct ModuleNode {
    type_name: String,
    children: Vec<(String, ModuleId)>,
    parameters: Vec<(String, TensorId)>,
    buffers: Vec<(String, TensorId)>,
    fsdp_state: Option<UnitId>,
    replicated: bool,
}

impl ModuleNode {
    /// Type name, used in diagnostics.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Direct children in registration order.
    pub fn children(&self) -> &[(String, ModuleId)] {
        &self.children
    }

    /// Direct parameters in registration order.
    pub fn parameters(&self) -> &[(String, TensorId)] {
        &self.parameters
    }

    /// Direct buffers in registration order.
    pub fn buffers(&self) -> &[(String, TensorId)] {
        &self.buffers
    }

    /// Unit that wraps this module, if any.
    pub fn fsdp_state(&self) -> Option<UnitId> {
        self.fsdp_state
    }

    /// Whether `replicate` was applied to this module.
    pub fn is_replicated(&self) -> bool {
        self.replicated
    }
}

/// An arena of modules and tensors.
///
/// Modules and tensors are addressed by [`ModuleId`] and [`TensorId`]. The same module may
/// be registered under several parents and the same tensor under several attributes; both
/// are then shared by identity. Replacing a tensor value through [`ModuleTree::set_tensor`]
/// is seen through every attribute holding it.
///
/// Ids belong to the tree that issued them. Accessors taking an id from another tree
/// panic or address an unrelated slot.
#[derive(Clone, Debug, Default)]
pub struct ModuleTree {
    modules: Vec<ModuleNode>,
    tensors: Vec<Slot>,
}

impl ModuleTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module without any parent.
    pub fn add_module<S: Into<String>>(&mut self, type_name: S) -> ModuleId {
        self.modules.push(ModuleNode {
            type_name: type_name.into(),
            children: Vec::new(),
            parameters: Vec::new(),
            buffers: Vec::new(),
            fsdp_state: None,
            replicated: false,
        });
        ModuleId(self.modules.len() - 1)
    }

    /// Registers `child` under `parent`, replacing any child with the same name.
    pub fn set_child(&mut self, parent: ModuleId, name: &str, child: ModuleId) {
        let children = &mut self.modules[parent.0].children;
        match children.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = child,
            None => children.push((name.to_string(), child)),
        }
    }

    /// Registers a new parameter, replacing any parameter with the same name.
    pub fn register_parameter<V: Into<TensorValue>>(
        &mut self,
        module: ModuleId,
        name: &str,
        value: V,
    ) -> TensorId {
        let id = self.push_slot(value.into(), TensorKind::Parameter);
        Self::bind(&mut self.modules[module.0].parameters, name, id);
        id
    }

    /// Registers a new buffer, replacing any buffer with the same name.
    pub fn register_buffer<V: Into<TensorValue>>(
        &mut self,
        module: ModuleId,
        name: &str,
        value: V,
    ) -> TensorId {
        let id = self.push_slot(value.into(), TensorKind::Buffer);
        Self::bind(&mut self.modules[module.0].buffers, name, id);
        id
    }

    /// Binds the attribute `name` of `module` to an existing tensor, sharing it.
    pub fn tie(&mut self, module: ModuleId, name: &str, tensor: TensorId) {
        let node = &mut self.modules[module.0];
        match self.tensors[tensor.0].kind {
            TensorKind::Parameter => Self::bind(&mut node.parameters, name, tensor),
            TensorKind::Buffer => Self::bind(&mut node.buffers, name, tensor),
        }
    }

    fn push_slot(&mut self, value: TensorValue, kind: TensorKind) -> TensorId {
        self.tensors.push(Slot { value, kind });
        TensorId(self.tensors.len() - 1)
    }

    fn bind(attributes: &mut Vec<(String, TensorId)>, name: &str, id: TensorId) {
        match attributes.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = id,
            None => attributes.push((name.to_string(), id)),
        }
    }

    /// The module node.
    ///
    /// # Panics
    ///
    /// If `module` was issued by another tree.
    pub fn node(&self, module: ModuleId) -> &ModuleNode {
        &self.modules[module.0]
    }

    /// Child registered under `name`.
    pub fn child(&self, module: ModuleId, name: &str) -> Option<ModuleId> {
        self.node(module)
            .children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, child)| *child)
    }

    /// Module reached by following a dotted path; the empty path is `module` itself.
    pub fn get_submodule(&self, module: ModuleId, path: &str) -> Option<ModuleId> {
        if path.is_empty() {
            return Some(module);
        }
        path.split('.')
            .try_fold(module, |current, name| self.child(current, name))
    }

    /// Tensor held by the attribute `name` of `module`.
    pub fn tensor_id(&self, module: ModuleId, name: &str) -> Option<TensorId> {
        let node = self.node(module);
        node.parameters
            .iter()
            .chain(&node.buffers)
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }

    /// Value held by the attribute `name` of `module`.
    pub fn get_tensor(&self, module: ModuleId, name: &str) -> Option<&TensorValue> {
        self.tensor_id(module, name).map(|id| self.tensor(id))
    }

    /// Replaces the value held by the attribute `name` of `module`.
    pub fn set_tensor(&mut self, module: ModuleId, name: &str, value: TensorValue) -> Result<()> {
        let id = self
            .tensor_id(module, name)
            .ok_or_else(|| FsdpError::UnknownAttribute {
                module: self.node(module).type_name.clone(),
                name: name.to_string(),
            })?;
        self.replace(id, value);
        Ok(())
    }

    /// The tensor value.
    ///
    /// # Panics
    ///
    /// If `id` was issued by another tree.
    pub fn tensor(&self, id: TensorId) -> &TensorValue {
        &self.tensors[id.0].value
    }

    /// The tensor value, mutably.
    ///
    /// # Panics
    ///
    /// If `id` was issued by another tree.
    pub fn tensor_mut(&mut self, id: TensorId) -> &mut TensorValue {
        &mut self.tensors[id.0].value
    }

    /// Whether the tensor is a parameter or a buffer.
    pub fn tensor_kind(&self, id: TensorId) -> TensorKind {
        self.tensors[id.0].kind
    }

    /// Replaces a tensor value for every attribute holding it.
    ///
    /// # Panics
    ///
    /// If `id` was issued by another tree.
    pub fn replace(&mut self, id: TensorId, value: TensorValue) {
        self.tensors[id.0].value = value;
    }

    pub(crate) fn set_fsdp_state(&mut self, module: ModuleId, unit: UnitId) {
        self.modules[module.0].fsdp_state = Some(unit);
    }

    pub(crate) fn set_replicated(&mut self, module: ModuleId) {
        self.modules[module.0].replicated = true;
    }

    /// Modules reachable from `root` in pre-order with their dotted names, each module once.
    pub fn named_modules(&self, root: ModuleId) -> Vec<(String, ModuleId)> {
        let mut out = Vec::new();
        self.walk(root, String::new(), &mut Some(HashSet::new()), &mut out);
        out
    }

    /// Every path from `root` in pre-order, a shared module once per path.
    pub fn named_modules_with_duplicates(&self, root: ModuleId) -> Vec<(String, ModuleId)> {
        let mut out = Vec::new();
        self.walk(root, String::new(), &mut None, &mut out);
        out
    }

    fn walk(
        &self,
        module: ModuleId,
        prefix: String,
        visited: &mut Option<HashSet<ModuleId>>,
        out: &mut Vec<(String, ModuleId)>,
    ) {
        if let Some(visited) = visited {
            if !visited.insert(module) {
                return;
            }
        }
        out.push((prefix.clone(), module));
        for (name, child) in &self.node(module).children {
            self.walk(*child, join(&prefix, name), visited, out);
        }
    }

    /// Modules reachable from `root` in pre-order, each module once.
    pub fn modules(&self, root: ModuleId) -> Vec<ModuleId> {
        self.named_modules(root)
            .into_iter()
            .map(|(_, module)| module)
            .collect()
    }

    /// Parameters reachable from `root` with the name of their first occurrence.
    pub fn named_parameters(&self, root: ModuleId) -> Vec<(String, TensorId)> {
        self.named_tensors(root, |node| &node.parameters)
    }

    /// Buffers reachable from `root` with the name of their first occurrence.
    pub fn named_buffers(&self, root: ModuleId) -> Vec<(String, TensorId)> {
        self.named_tensors(root, |node| &node.buffers)
    }

    /// Parameters reachable from `root`, each tensor once.
    pub fn parameters(&self, root: ModuleId) -> Vec<TensorId> {
        self.named_parameters(root).into_iter().map(|(_, id)| id).collect()
    }

    /// Buffers reachable from `root`, each tensor once.
    pub fn buffers(&self, root: ModuleId) -> Vec<TensorId> {
        self.named_buffers(root).into_iter().map(|(_, id)| id).collect()
    }

    fn named_tensors<F>(&self, root: ModuleId, attributes: F) -> Vec<(String, TensorId)>
    where
        F: Fn(&ModuleNode) -> &Vec<(String, TensorId)>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (prefix, module) in self.named_modules(root) {
            for (name, id) in attributes(self.node(module)) {
                if seen.insert(*id) {
                    out.push((join(&prefix, name), *id));
                }
            }
        }
        out
    }

    /// Parameters then buffers reachable from `root`, keyed by FQN.
    pub fn state_dict(&self, root: ModuleId) -> Vec<(String, TensorValue)> {
        self.named_parameters(root)
            .into_iter()
            .chain(self.named_buffers(root))
            .map(|(fqn, id)| (fqn, self.tensor(id).clone()))
            .collect()
    }

    /// Assigns every entry of `state_dict` to the tensor with the same FQN.
    ///
    /// The keys must match [`ModuleTree::state_dict`] exactly. Values are assigned as
    /// given, so sharded entries replace the sharded tensors.
    pub fn load_state_dict(
        &mut self,
        root: ModuleId,
        state_dict: Vec<(String, TensorValue)>,
    ) -> Result<()> {
        let targets: HashMap<String, TensorId> = self
            .named_parameters(root)
            .into_iter()
            .chain(self.named_buffers(root))
            .collect();

        let mut missing: Vec<String> = targets
            .keys()
            .filter(|fqn| !state_dict.iter().any(|(key, _)| key == *fqn))
            .cloned()
            .collect();
        let unexpected: Vec<String> = state_dict
            .iter()
            .filter(|(key, _)| !targets.contains_key(key))
            .map(|(key, _)| key.clone())
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            missing.sort();
            return Err(FsdpError::StateDictMismatch {
                missing,
                unexpected,
            });
        }

        for (fqn, value) in state_dict {
            if let Some(id) = targets.get(&fqn) {
                self.replace(*id, value);
            }
        }
        Ok(())
    }

    /// Allocates storage on `device` for every meta tensor reachable from `root`.
    pub fn to_empty(&mut self, root: ModuleId, device: Device) {
        for id in self.parameters(root).into_iter().chain(self.buffers(root)) {
            let value = self.tensor(id).to_empty(device);
            self.replace(id, value);
        }
        log::debug!("materialized module tree on {device}");
    }

    /// Re-initializes every tensor reachable from `root`.
    ///
    /// Parameters are drawn uniformly from `[-1/sqrt(fan_in), 1/sqrt(fan_in))`, where
    /// `fan_in` comes from the module's `weight`. Buffers are drawn from `[-1, 1)`. Sharded
    /// tensors only re-initialize their local shard.
    pub fn reset_parameters<R: Rng>(&mut self, root: ModuleId, rng: &mut R) {
        for module in self.modules(root) {
            let bound = 1.0 / (self.fan_in(module).max(1) as f32).sqrt();
            let node = self.node(module);
            let parameters: Vec<TensorId> = node.parameters.iter().map(|(_, id)| *id).collect();
            let buffers: Vec<TensorId> = node.buffers.iter().map(|(_, id)| *id).collect();

            for id in parameters {
                self.tensor_mut(id)
                    .local_mut()
                    .map_inplace(|x| *x = rng.random_range(-bound..bound));
            }
            for id in buffers {
                self.tensor_mut(id)
                    .local_mut()
                    .map_inplace(|x| *x = rng.random_range(-1.0..1.0));
            }
        }
    }

    fn fan_in(&self, module: ModuleId) -> usize {
        let shape = match self.get_tensor(module, "weight") {
            Some(weight) => weight.shape().to_vec(),
            None => self
                .node(module)
                .parameters
                .first()
                .map(|(_, id)| self.tensor(*id).shape().to_vec())
                .unwrap_or_default(),
        };
        match shape.as_slice() {
            [] => 1,
            [size] => *size,
            [_, rest @ ..] => rest.iter().product(),
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

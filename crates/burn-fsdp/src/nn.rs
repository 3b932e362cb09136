//! Building blocks for module trees.

use burn_distributed::{Device, Tensor};
use derive_new::new;
use rand::Rng;

use crate::{ModuleId, ModuleTree};

/// Configuration to create a linear layer with `weight: [d_output, d_input]` and an
/// optional `bias: [d_output]`.
#[derive(new, Clone, Debug)]
pub struct LinearConfig {
    /// The size of the input features.
    pub d_input: usize,
    /// The size of the output features.
    pub d_output: usize,
    /// If a bias should be applied during the linear transformation.
    #[new(value = "true")]
    pub bias: bool,
}

impl LinearConfig {
    /// Sets whether the layer has a bias.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Adds a linear layer to `tree`.
    ///
    /// Values are drawn from `rng` unless `device` is the meta device.
    pub fn init<R: Rng>(&self, tree: &mut ModuleTree, device: Device, rng: &mut R) -> ModuleId {
        let module = tree.add_module("Linear");
        let bound = 1.0 / (self.d_input.max(1) as f32).sqrt();
        let weight = uniform(&[self.d_output, self.d_input], bound, device, rng);
        tree.register_parameter(module, "weight", weight);
        if self.bias {
            let bias = uniform(&[self.d_output], bound, device, rng);
            tree.register_parameter(module, "bias", bias);
        }
        module
    }
}

/// Configuration to create a two-layer perceptron with `in_proj` and `out_proj`.
#[derive(new, Clone, Debug)]
pub struct MlpConfig {
    /// Input and output size.
    pub dim: usize,
    /// Hidden size is `dim * dim_multiplier`.
    #[new(value = "4")]
    pub dim_multiplier: usize,
    /// Whether to register a `buffer` of shape `[dim]`.
    #[new(value = "false")]
    pub with_buffer: bool,
}

impl MlpConfig {
    /// Sets the hidden size multiplier.
    pub fn with_dim_multiplier(mut self, dim_multiplier: usize) -> Self {
        self.dim_multiplier = dim_multiplier;
        self
    }

    /// Sets whether the module carries a buffer.
    pub fn with_buffer(mut self, with_buffer: bool) -> Self {
        self.with_buffer = with_buffer;
        self
    }

    /// Adds the perceptron to `tree`.
    pub fn init<R: Rng>(&self, tree: &mut ModuleTree, device: Device, rng: &mut R) -> ModuleId {
        let hidden = self.dim * self.dim_multiplier;
        let module = tree.add_module("MLP");
        let in_proj = LinearConfig::new(self.dim, hidden).init(tree, device, rng);
        let out_proj = LinearConfig::new(hidden, self.dim).init(tree, device, rng);
        tree.set_child(module, "in_proj", in_proj);
        tree.set_child(module, "out_proj", out_proj);
        if self.with_buffer {
            let buffer = uniform(&[self.dim], 1.0, device, rng);
            tree.register_buffer(module, "buffer", buffer);
        }
        module
    }
}

/// Adds a container whose children are named `"0"`, `"1"`, ...
pub fn sequential(tree: &mut ModuleTree, children: &[ModuleId]) -> ModuleId {
    let module = tree.add_module("Sequential");
    for (index, child) in children.iter().enumerate() {
        tree.set_child(module, &index.to_string(), *child);
    }
    module
}

fn uniform<R: Rng>(shape: &[usize], bound: f32, device: Device, rng: &mut R) -> Tensor {
    if device.is_meta() {
        return Tensor::meta(shape);
    }
    let mut tensor = Tensor::zeros(shape, device);
    tensor.map_inplace(|x| *x = rng.random_range(-bound..bound));
    tensor
}

use derive_new::new;
use hashbrown::{HashMap, HashSet};

use crate::{FsdpError, ModuleId, ModuleTree, Result, TensorId};

/// Where a managed parameter lives in the module tree.
///
/// `module.param_name` is the first attribute holding the parameter in traversal order.
/// Every other attribute holding the same tensor is listed in `shared_modules` and
/// `shared_param_names`, pairwise.
#[derive(new, Clone, Debug, PartialEq, Eq)]
pub struct ParamModuleInfo {
    /// Owning module.
    pub module: ModuleId,
    /// Attribute name on the owning module.
    pub param_name: String,
    /// Other modules holding the same tensor.
    #[new(default)]
    pub shared_modules: Vec<ModuleId>,
    /// Attribute names on `shared_modules`.
    #[new(default)]
    pub shared_param_names: Vec<String>,
}

impl ParamModuleInfo {
    /// Every `(module, attribute)` pair holding the parameter, owner first.
    pub fn aliases(&self) -> impl Iterator<Item = (ModuleId, &str)> {
        core::iter::once((self.module, self.param_name.as_str())).chain(
            self.shared_modules
                .iter()
                .copied()
                .zip(self.shared_param_names.iter().map(String::as_str)),
        )
    }
}

/// Resolves the owner and aliases of each parameter, in the order of `params`.
///
/// Every path from each of `roots` is traversed, so a module reachable through several
/// parents contributes one alias per path.
pub fn get_param_module_infos(
    tree: &ModuleTree,
    params: &[TensorId],
    roots: &[ModuleId],
) -> Result<Vec<ParamModuleInfo>> {
    let param_set: HashSet<TensorId> = params.iter().copied().collect();
    let mut infos: HashMap<TensorId, ParamModuleInfo> = HashMap::new();

    for root in roots {
        for (_, module) in tree.named_modules_with_duplicates(*root) {
            for (name, id) in tree.node(module).parameters() {
                if !param_set.contains(id) {
                    continue;
                }
                match infos.get_mut(id) {
                    Some(info) => {
                        info.shared_modules.push(module);
                        info.shared_param_names.push(name.clone());
                    }
                    None => {
                        infos.insert(*id, ParamModuleInfo::new(module, name.clone()));
                    }
                }
            }
        }
    }

    let missing: Vec<String> = params
        .iter()
        .filter(|id| !infos.contains_key(*id))
        .map(|id| id.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(FsdpError::MissingFromModuleTree(missing));
    }

    Ok(params
        .iter()
        .filter_map(|id| infos.get(id).cloned())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::{get_managed_modules, get_managed_states};
    use crate::nn::{MlpConfig, sequential};
    use burn_distributed::Device;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn model(tree: &mut ModuleTree, count: usize) -> (ModuleId, Vec<ModuleId>) {
        let mut rng = StdRng::seed_from_u64(0);
        let children: Vec<ModuleId> = (0..count)
            .map(|_| MlpConfig::new(8).init(tree, Device::Cpu, &mut rng))
            .collect();
        (sequential(tree, &children), children)
    }

    fn proj(tree: &ModuleTree, mlp: ModuleId, name: &str) -> ModuleId {
        tree.child(mlp, name).unwrap()
    }

    #[test]
    fn test_get_param_module_infos_shared_params() {
        let mut tree = ModuleTree::new();
        let (model, mlps) = model(&mut tree, 2);
        let in_proj0 = proj(&tree, mlps[0], "in_proj");
        let in_proj1 = proj(&tree, mlps[1], "in_proj");
        let shared = tree.tensor_id(in_proj1, "weight").unwrap();
        tree.tie(in_proj0, "weight", shared);

        let managed = get_managed_modules(&tree, &[model]);
        let (params, _) = get_managed_states(&tree, &managed);
        assert_eq!(params.len(), 7);
        let infos = get_param_module_infos(&tree, &params, &[model]).unwrap();
        assert_eq!(infos.len(), params.len());

        let out_proj0 = proj(&tree, mlps[0], "out_proj");
        let out_proj1 = proj(&tree, mlps[1], "out_proj");
        let mut shared_info = ParamModuleInfo::new(in_proj0, "weight".into());
        shared_info.shared_modules.push(in_proj1);
        shared_info.shared_param_names.push("weight".into());
        assert_eq!(
            infos,
            vec![
                shared_info.clone(),
                ParamModuleInfo::new(in_proj0, "bias".into()),
                ParamModuleInfo::new(out_proj0, "weight".into()),
                ParamModuleInfo::new(out_proj0, "bias".into()),
                ParamModuleInfo::new(in_proj1, "bias".into()),
                ParamModuleInfo::new(out_proj1, "weight".into()),
                ParamModuleInfo::new(out_proj1, "bias".into()),
            ]
        );

        let aliases: Vec<(ModuleId, &str)> = shared_info.aliases().collect();
        assert_eq!(aliases, vec![(in_proj0, "weight"), (in_proj1, "weight")]);
    }

    #[test]
    fn test_get_param_module_infos_duplicates() {
        let mut tree = ModuleTree::new();
        let mlp = MlpConfig::new(8).init(&mut tree, Device::Cpu, &mut StdRng::seed_from_u64(0));
        let model = sequential(&mut tree, &[mlp, mlp]);
        let params = tree.parameters(model);
        let infos = get_param_module_infos(&tree, &params, &[model]).unwrap();
        assert_eq!(infos.len(), params.len());

        let in_proj = proj(&tree, mlp, "in_proj");
        let out_proj = proj(&tree, mlp, "out_proj");
        let expected: Vec<ParamModuleInfo> = [
            (in_proj, "weight"),
            (in_proj, "bias"),
            (out_proj, "weight"),
            (out_proj, "bias"),
        ]
        .into_iter()
        .map(|(module, name)| ParamModuleInfo {
            module,
            param_name: name.into(),
            shared_modules: vec![module],
            shared_param_names: vec![name.into()],
        })
        .collect();
        assert_eq!(infos, expected);
    }

    #[test]
    fn test_get_param_module_infos_shared_module() {
        let mut tree = ModuleTree::new();
        let (model, mlps) = model(&mut tree, 2);
        let in_proj1 = proj(&tree, mlps[1], "in_proj");
        tree.set_child(mlps[0], "in_proj", in_proj1);

        let params = tree.parameters(model);
        let infos = get_param_module_infos(&tree, &params, &[model]).unwrap();
        assert_eq!(infos.len(), params.len());
        assert_eq!(infos[0].module, in_proj1);
        assert_eq!(infos[0].shared_modules, vec![in_proj1]);
        assert_eq!(infos[1].shared_param_names, vec!["bias".to_string()]);
    }

    #[test]
    fn test_get_param_module_infos_list_of_mlps() {
        let mut tree = ModuleTree::new();
        let (model, mlps) = model(&mut tree, 2);
        let managed = get_managed_modules(&tree, &mlps);
        let (params, _) = get_managed_states(&tree, &managed);
        let infos = get_param_module_infos(&tree, &params, &[model]).unwrap();
        assert_eq!(infos.len(), 8);
        assert!(infos.iter().all(|info| info.shared_modules.is_empty()));
    }

    #[test]
    fn test_missing_param_is_an_error() {
        let mut tree = ModuleTree::new();
        let (model, _) = model(&mut tree, 1);
        let stray = tree.add_module("Stray");
        let orphan = tree.register_parameter(stray, "weight", burn_distributed::Tensor::zeros(&[1], Device::Cpu));

        let err = get_param_module_infos(&tree, &[orphan], &[model]).unwrap_err();
        assert!(matches!(err, FsdpError::MissingFromModuleTree(ref names) if names.len() == 1));
    }
}

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::{HashMap, HashSet};
use ndarray::{ArrayD, ArrayViewD, Dimension, IxDyn};
use thiserror::Error;

use crate::{Collective, Device, DeviceType, ProcessGroup};

/// Represents a logical mesh dimension, identified by a unique name.
///
/// Mesh dimensions are used to define the logical structure of a device mesh.
/// They help organize and partition parallel computation workloads, such as data,
/// tensor, or pipeline parallelism, across the mesh. Each dimension is named
/// to provide unambiguous mapping during sharding operations.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MeshDim {
    /// A name that uniquely identifies the mesh dimension.
    name: String,
}

impl MeshDim {
    /// Constructs a new [`MeshDim`] with the given name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        MeshDim { name: name.into() }
    }

    /// The dimension name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Represents a logical arrangement of process ranks used for parallel computation.
///
/// A `DeviceMesh` is an N-dimensional array of global ranks, where each dimension can be
/// given a unique name (e.g., `"dp"`, `"tp"`, `"replicate"`, `"shard"`). Every rank of the
/// mesh uses the same [`DeviceType`]. For the calling rank, the mesh holds one
/// [`ProcessGroup`] per dimension: the ranks that differ from the caller only along that
/// dimension.
///
/// For example, a 2D mesh `[[0, 1], [2, 3]]` with dimensions `["dp", "tp"]` represents
/// 2-way data parallelism over 2-way tensor parallelism. Rank 1 has coordinate `[0, 1]`,
/// its `"dp"` group is `[1, 3]` and its `"tp"` group is `[0, 1]`.
///
/// A mesh obtained through [`DeviceMesh::slice`] remembers the mesh it was sliced from
/// (its root). Equality ignores that lineage: two meshes are equal when their device type,
/// rank array, dimension names and caller coordinate are equal.
#[derive(Clone, Debug)]
pub struct DeviceMesh {
    /// Device type shared by every rank.
    device_type: DeviceType,
    /// Global ranks in an n-dimensional logical arrangement.
    mesh: ArrayD<usize>,
    /// Dimension names, in dimension order.
    dim_names: Option<Vec<MeshDim>>,
    /// Process group of the caller along each dimension.
    dim_groups: Vec<ProcessGroup>,
    /// Coordinate of the caller, `None` when the caller is not part of the mesh.
    coordinate: Option<Vec<usize>>,
    /// Mesh this one was sliced from.
    root: Option<Arc<DeviceMesh>>,
}

/// Represents errors that can occur when constructing or slicing a `DeviceMesh`.
///
/// These errors are typically related to invalid dimension mappings or mismatches
/// between the rank count and the mesh shape.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum DeviceMeshError {
    /// An invalid dimension was specified.
    #[error("invalid mesh dimension: {0}")]
    InvalidDimension(String),
    /// The mesh configuration is invalid.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
    /// The process groups do not describe the mesh.
    #[error("invalid mesh groups: {0}")]
    InvalidGroup(String),
}

/// A builder for constructing a [`DeviceMesh`].
///
/// This builder allows you to define a logical mesh structure with a shape and
/// specific dimension mappings. Once all dimensions are mapped, the builder can
/// be used to construct the [`DeviceMesh`] instance.
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder {
    /// Device type shared by every rank.
    device_type: DeviceType,
    /// Global ranks in an n-dimensional logical arrangement.
    ranks: Vec<usize>,
    /// Shape of the logical mesh.
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh.
    dims: HashMap<MeshDim, usize>,
}

impl DeviceMeshBuilder {
    /// Creates a new [`DeviceMeshBuilder`] with the given ranks and shape.
    ///
    /// # Arguments
    /// * `device_type` - The device type of every rank.
    /// * `ranks` - Global ranks in row-major order.
    /// * `shape` - A vector representing the shape (dimensions) of the mesh.
    pub fn new<S: Into<Vec<usize>>>(device_type: DeviceType, ranks: Vec<usize>, shape: S) -> Self {
        Self {
            device_type,
            ranks,
            shape: shape.into(),
            dims: HashMap::new(),
        }
    }

    /// Adds a dimension to the logical mesh, associating it with a specific index.
    ///
    /// Each dimension represents a logical axis of parallelism and should correspond to a
    /// unique index in the shape of the mesh. Naming is optional, but once one dimension is
    /// named every dimension must be.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let mesh = DeviceMeshBuilder::new(DeviceType::Cuda, vec![0, 1, 2, 3], [2, 2])
    ///     .with_dim(0, MeshDim::new("dp"))
    ///     .with_dim(1, MeshDim::new("tp"))
    ///     .build(&comm)
    ///     .unwrap();
    /// ```
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.insert(dim, idx);
        self
    }

    /// Builds a [`DeviceMesh`] from the current configuration.
    ///
    /// Validates the dimension mapping, the rank count and rank uniqueness, then creates
    /// the caller's per-dimension process groups through `comm`.
    pub fn build(self, comm: &dyn Collective) -> Result<DeviceMesh, DeviceMeshError> {
        let ndim = self.shape.len();
        let mut seen_indices = HashSet::new();

        for &idx in self.dims.values() {
            if idx >= ndim {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Index {} exceeds mesh shape {:?}",
                    idx, self.shape
                )));
            }
            if !seen_indices.insert(idx) {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Dimension {} already mapped",
                    idx
                )));
            }
        }

        if !self.dims.is_empty() && seen_indices.len() != ndim {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Not all mesh dimensions are mapped. Got {}, expected {}",
                seen_indices.len(),
                ndim
            )));
        }

        let expected_ranks = self.shape.iter().product::<usize>();
        if self.ranks.len() != expected_ranks {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Device count ({}) doesn't match mesh shape {:?}",
                self.ranks.len(),
                self.shape,
            )));
        }

        if self.ranks.iter().collect::<HashSet<_>>().len() != self.ranks.len() {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Ranks must be unique but got {:?}",
                self.ranks
            )));
        }

        let dim_names = if self.dims.is_empty() {
            None
        } else {
            let mut names: Vec<(usize, MeshDim)> =
                self.dims.into_iter().map(|(dim, idx)| (idx, dim)).collect();
            names.sort_by_key(|(idx, _)| *idx);
            Some(names.into_iter().map(|(_, dim)| dim).collect())
        };

        let mesh = ArrayD::from_shape_vec(IxDyn(&self.shape), self.ranks)
            .map_err(|err| DeviceMeshError::InvalidMesh(err.to_string()))?;
        DeviceMesh::assemble(comm, self.device_type, mesh, dim_names)
    }
}

/// Creates a mesh over every rank of the world, laid out in row-major order.
///
/// The product of `shape` must equal the world size.
pub fn init_device_mesh(
    comm: &dyn Collective,
    device_type: DeviceType,
    shape: &[usize],
    dim_names: Option<&[&str]>,
) -> Result<DeviceMesh, DeviceMeshError> {
    let world_size = comm.world_size();
    if shape.iter().product::<usize>() != world_size {
        return Err(DeviceMeshError::InvalidMesh(format!(
            "Device count ({}) doesn't match mesh shape {:?}",
            world_size, shape,
        )));
    }

    let mut builder = DeviceMeshBuilder::new(device_type, (0..world_size).collect(), shape);
    if let Some(names) = dim_names {
        if names.len() != shape.len() {
            return Err(DeviceMeshError::InvalidDimension(format!(
                "Got {} dimension names for mesh shape {:?}",
                names.len(),
                shape
            )));
        }
        for (idx, name) in names.iter().enumerate() {
            builder = builder.with_dim(idx, MeshDim::new(*name));
        }
    }
    builder.build(comm)
}

impl DeviceMesh {
    fn assemble(
        comm: &dyn Collective,
        device_type: DeviceType,
        mesh: ArrayD<usize>,
        dim_names: Option<Vec<MeshDim>>,
    ) -> Result<Self, DeviceMeshError> {
        let coordinate = coordinate_of(&mesh, comm.rank());
        let dim_groups = match &coordinate {
            Some(coordinate) => (0..mesh.ndim())
                .map(|dim| {
                    comm.new_group(lane(&mesh, coordinate, dim))
                        .map_err(|err| DeviceMeshError::InvalidGroup(err.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            device_type,
            mesh,
            dim_names,
            dim_groups,
            coordinate,
            root: None,
        })
    }

    /// Creates a mesh from process groups created outside of the mesh.
    ///
    /// With a single group and no explicit `mesh`, the result is the 1D mesh of that
    /// group's ranks. Several groups require the rank array, one group per dimension in
    /// dimension order. The result has no root mesh.
    pub fn from_group(
        comm: &dyn Collective,
        groups: &[ProcessGroup],
        device_type: DeviceType,
        dim_names: Option<&[&str]>,
        mesh: Option<ArrayD<usize>>,
    ) -> Result<Self, DeviceMeshError> {
        let mesh = match (mesh, groups) {
            (Some(mesh), _) => mesh,
            (None, [group]) => ArrayD::from_shape_vec(IxDyn(&[group.size()]), group.ranks().to_vec())
                .map_err(|err| DeviceMeshError::InvalidMesh(err.to_string()))?,
            (None, _) => {
                return Err(DeviceMeshError::InvalidMesh(format!(
                    "Expects the rank array when passing {} groups",
                    groups.len()
                )));
            }
        };

        if mesh.ndim() != groups.len() {
            return Err(DeviceMeshError::InvalidGroup(format!(
                "Expects one group per mesh dimension but got {} group(s) for a {}D mesh",
                groups.len(),
                mesh.ndim()
            )));
        }

        let dim_names = match dim_names {
            Some(names) if names.len() != mesh.ndim() => {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Got {} dimension names for a {}D mesh",
                    names.len(),
                    mesh.ndim()
                )));
            }
            Some(names) => Some(names.iter().map(|name| MeshDim::new(*name)).collect()),
            None => None,
        };

        let rank = comm.rank();
        let coordinate = coordinate_of(&mesh, rank);
        if let Some(coordinate) = &coordinate {
            for (dim, group) in groups.iter().enumerate() {
                let expected = lane(&mesh, coordinate, dim);
                if group.ranks() != expected.as_slice() {
                    return Err(DeviceMeshError::InvalidGroup(format!(
                        "Group {:?} of rank {} does not match mesh dimension {} ({:?})",
                        group.ranks(),
                        rank,
                        dim,
                        expected
                    )));
                }
            }
        }

        Ok(Self {
            device_type,
            mesh,
            dim_names,
            dim_groups: if coordinate.is_some() {
                groups.to_vec()
            } else {
                Vec::new()
            },
            coordinate,
            root: None,
        })
    }

    /// Returns the 1D mesh along the named dimension that contains the caller.
    pub fn slice(&self, name: &str) -> Result<DeviceMesh, DeviceMeshError> {
        let dim = self.dim_index(name)?;
        let coordinate = self.require_coordinate()?;
        let ranks = lane(&self.mesh, coordinate, dim);
        let mesh = ArrayD::from_shape_vec(IxDyn(&[ranks.len()]), ranks)
            .map_err(|err| DeviceMeshError::InvalidMesh(err.to_string()))?;

        let root = match &self.root {
            Some(root) => root.clone(),
            None => Arc::new(self.clone()),
        };

        Ok(DeviceMesh {
            device_type: self.device_type,
            mesh,
            dim_names: Some(vec![MeshDim::new(name)]),
            dim_groups: vec![self.dim_groups[dim].clone()],
            coordinate: Some(vec![coordinate[dim]]),
            root: Some(root),
        })
    }

    /// The mesh this one was sliced from, or itself.
    pub fn root_mesh(&self) -> &DeviceMesh {
        self.root.as_deref().unwrap_or(self)
    }

    /// Whether this mesh was sliced from another one.
    pub fn has_root(&self) -> bool {
        self.root.is_some()
    }

    /// Index of the named dimension.
    pub fn dim_index(&self, name: &str) -> Result<usize, DeviceMeshError> {
        self.dim_names
            .as_ref()
            .and_then(|names| names.iter().position(|dim| dim.name() == name))
            .ok_or_else(|| {
                DeviceMeshError::InvalidDimension(format!(
                    "Mesh dimension '{}' does not exist in {}",
                    name, self
                ))
            })
    }

    /// Process group of the caller along `dim`.
    pub fn get_group(&self, dim: usize) -> Result<&ProcessGroup, DeviceMeshError> {
        self.require_coordinate()?;
        self.dim_groups.get(dim).ok_or_else(|| {
            DeviceMeshError::InvalidDimension(format!(
                "Index {} exceeds mesh shape {:?}",
                dim,
                self.shape()
            ))
        })
    }

    /// Process group of the caller along the named dimension.
    pub fn get_group_by_name(&self, name: &str) -> Result<&ProcessGroup, DeviceMeshError> {
        self.get_group(self.dim_index(name)?)
    }

    /// Coordinate of the caller along `dim`.
    pub fn get_local_rank(&self, dim: usize) -> Result<usize, DeviceMeshError> {
        let coordinate = self.require_coordinate()?;
        coordinate.get(dim).copied().ok_or_else(|| {
            DeviceMeshError::InvalidDimension(format!(
                "Index {} exceeds mesh shape {:?}",
                dim,
                self.shape()
            ))
        })
    }

    /// Coordinate of the caller along the named dimension.
    pub fn get_local_rank_by_name(&self, name: &str) -> Result<usize, DeviceMeshError> {
        self.get_local_rank(self.dim_index(name)?)
    }

    /// Global rank of the caller.
    pub fn get_rank(&self) -> Result<usize, DeviceMeshError> {
        let coordinate = self.require_coordinate()?;
        Ok(self.mesh[IxDyn(coordinate)])
    }

    /// Device of the caller on this mesh, `cuda:<rank>` or `cpu`.
    pub fn local_device(&self) -> Result<Device, DeviceMeshError> {
        Ok(self.device_type.device(self.get_rank()?))
    }

    /// Device type of every rank.
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// The rank array.
    pub fn mesh(&self) -> &ArrayD<usize> {
        &self.mesh
    }

    /// Global ranks in row-major order.
    pub fn ranks(&self) -> Vec<usize> {
        self.mesh.iter().copied().collect()
    }

    /// Mesh shape.
    pub fn shape(&self) -> &[usize] {
        self.mesh.shape()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.mesh.ndim()
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.mesh.len()
    }

    /// Number of ranks along `dim`.
    pub fn size_of(&self, dim: usize) -> usize {
        self.mesh.shape().get(dim).copied().unwrap_or(1)
    }

    /// Dimension names, if any.
    pub fn dim_names(&self) -> Option<&[MeshDim]> {
        self.dim_names.as_deref()
    }

    /// Caller process groups, one per dimension.
    pub fn dim_groups(&self) -> &[ProcessGroup] {
        &self.dim_groups
    }

    /// Coordinate of the caller, `None` when it is not part of the mesh.
    pub fn coordinate(&self) -> Option<&[usize]> {
        self.coordinate.as_deref()
    }

    fn require_coordinate(&self) -> Result<&[usize], DeviceMeshError> {
        self.coordinate().ok_or_else(|| {
            DeviceMeshError::InvalidMesh(format!("The calling rank is not part of {}", self))
        })
    }
}

impl PartialEq for DeviceMesh {
    fn eq(&self, other: &Self) -> bool {
        self.device_type == other.device_type
            && self.mesh == other.mesh
            && self.dim_names == other.dim_names
            && self.coordinate == other.coordinate
    }
}

impl fmt::Display for DeviceMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceMesh('{}', {}", self.device_type, nested(self.mesh.view()))?;
        if let Some(names) = &self.dim_names {
            let names: Vec<String> = names.iter().map(|dim| format!("'{}'", dim.name())).collect();
            if names.len() == 1 {
                write!(f, ", mesh_dim_names=({},)", names[0])?;
            } else {
                write!(f, ", mesh_dim_names=({})", names.join(", "))?;
            }
        }
        f.write_str(")")
    }
}

fn nested(view: ArrayViewD<'_, usize>) -> String {
    if view.ndim() == 0 {
        return view.iter().map(|rank| rank.to_string()).collect();
    }
    let inner: Vec<String> = view.outer_iter().map(nested).collect();
    format!("[{}]", inner.join(", "))
}

fn coordinate_of(mesh: &ArrayD<usize>, rank: usize) -> Option<Vec<usize>> {
    mesh.indexed_iter()
        .find(|(_, r)| **r == rank)
        .map(|(index, _)| index.slice().to_vec())
}

/// Ranks that share `coordinate` on every dimension except `dim`.
fn lane(mesh: &ArrayD<usize>, coordinate: &[usize], dim: usize) -> Vec<usize> {
    let mut index = coordinate.to_vec();
    (0..mesh.shape()[dim])
        .map(|i| {
            index[dim] = i;
            mesh[IxDyn(&index)]
        })
        .collect()
}

use core::ops::Range;

use ndarray::{ArrayD, Axis, IxDyn, Slice};
use serde::{Deserialize, Serialize};

use crate::{Device, DistributedError, Result};

/// Element type tag of a [`Tensor`].
///
/// Values are always held as `f32`; the narrower types only round the stored values
/// to their precision.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit float.
    #[default]
    F32,
    /// IEEE half precision.
    F16,
    /// Brain float.
    BF16,
}

#[derive(Clone, Debug, PartialEq)]
enum Storage {
    Meta,
    Dense(ArrayD<f32>),
}

/// A dense N-dimensional tensor living on a single device.
///
/// Tensors placed on [`Device::Meta`] only carry their shape and dtype. Any operation that
/// needs the values fails with [`DistributedError::MetaTensor`] until the tensor has been
/// materialized with [`Tensor::to_empty`].
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    storage: Storage,
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
}

/// Row-major strides of a contiguous tensor with the given shape.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for dim in (0..shape.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * shape[dim + 1];
    }
    strides
}

impl Tensor {
    /// Wraps an array on the given device.
    ///
    /// Passing [`Device::Meta`] drops the values and keeps only the shape.
    pub fn from_array(array: ArrayD<f32>, device: Device) -> Self {
        let shape = array.shape().to_vec();
        let storage = if device.is_meta() {
            Storage::Meta
        } else {
            Storage::Dense(array)
        };
        Self {
            storage,
            shape,
            dtype: DType::F32,
            device,
        }
    }

    /// Creates a tensor from row-major values.
    pub fn from_vec(data: Vec<f32>, shape: &[usize], device: Device) -> Result<Self> {
        let len = data.len();
        let array = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| {
            DistributedError::ShapeMismatch {
                expected: shape.to_vec(),
                actual: vec![len],
            }
        })?;
        Ok(Self::from_array(array, device))
    }

    /// A tensor filled with `value`.
    pub fn full(shape: &[usize], value: f32, device: Device) -> Self {
        Self::from_array(ArrayD::from_elem(IxDyn(shape), value), device)
    }

    /// A tensor filled with zeros.
    pub fn zeros(shape: &[usize], device: Device) -> Self {
        Self::full(shape, 0.0, device)
    }

    /// A 0-dimensional tensor.
    pub fn scalar(value: f32, device: Device) -> Self {
        Self::full(&[], value, device)
    }

    /// A tensor on the meta device: shape only, no storage.
    pub fn meta(shape: &[usize]) -> Self {
        Self {
            storage: Storage::Meta,
            shape: shape.to_vec(),
            dtype: DType::F32,
            device: Device::Meta,
        }
    }

    /// The shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Contiguous row-major strides.
    pub fn stride(&self) -> Vec<usize> {
        contiguous_strides(&self.shape)
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// The element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The device.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Whether the tensor lives on the meta device.
    pub fn is_meta(&self) -> bool {
        matches!(self.storage, Storage::Meta)
    }

    /// The backing array.
    pub fn data(&self) -> Result<&ArrayD<f32>> {
        match &self.storage {
            Storage::Dense(array) => Ok(array),
            Storage::Meta => Err(self.meta_error()),
        }
    }

    /// The backing array, mutably.
    pub fn data_mut(&mut self) -> Result<&mut ArrayD<f32>> {
        match &mut self.storage {
            Storage::Dense(array) => Ok(array),
            Storage::Meta => Err(DistributedError::MetaTensor {
                shape: self.shape.clone(),
            }),
        }
    }

    /// Values in row-major order.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        Ok(self.data()?.iter().copied().collect())
    }

    /// Moves the tensor to `device`.
    ///
    /// Meta tensors stay on the meta device: their move is deferred until they are
    /// materialized with [`Tensor::to_empty`].
    pub fn to_device(&self, device: Device) -> Self {
        if self.is_meta() {
            return self.clone();
        }
        if device.is_meta() {
            let mut tensor = Self::meta(&self.shape);
            tensor.dtype = self.dtype;
            return tensor;
        }
        let mut tensor = self.clone();
        tensor.device = device;
        tensor
    }

    /// Allocates storage on `device` for a meta tensor.
    ///
    /// The values are unspecified (zeroed) and must be initialized by the caller. Tensors
    /// that already have storage are only moved.
    pub fn to_empty(&self, device: Device) -> Self {
        if !self.is_meta() {
            return self.to_device(device);
        }
        let mut tensor = Self::zeros(&self.shape, device);
        tensor.dtype = self.dtype;
        tensor
    }

    /// Casts to `dtype`, rounding the stored values to its precision.
    pub fn to_dtype(&self, dtype: DType) -> Self {
        let mut tensor = self.clone();
        tensor.dtype = dtype;
        if let Storage::Dense(array) = &mut tensor.storage {
            match dtype {
                DType::F32 => {}
                DType::F16 => array.mapv_inplace(|x| half::f16::from_f32(x).to_f32()),
                DType::BF16 => array.mapv_inplace(|x| half::bf16::from_f32(x).to_f32()),
            }
        }
        tensor
    }

    /// Fills the tensor with `value`. A no-op on the meta device.
    pub fn fill_(&mut self, value: f32) {
        if let Storage::Dense(array) = &mut self.storage {
            array.fill(value);
        }
    }

    /// Applies `f` to every element. A no-op on the meta device.
    pub fn map_inplace<F: FnMut(&mut f32)>(&mut self, f: F) {
        if let Storage::Dense(array) = &mut self.storage {
            array.map_inplace(f);
        }
    }

    /// Returns the sub-tensor `[start, start + len)` along `dim`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        self.check_dim(dim)?;
        let mut ranges: Vec<Range<usize>> = self.shape.iter().map(|&size| 0..size).collect();
        ranges[dim] = start..start + len;
        self.slice(&ranges)
    }

    /// Returns the sub-tensor covered by one half-open range per dimension.
    pub fn slice(&self, ranges: &[Range<usize>]) -> Result<Self> {
        self.check_ranges(ranges)?;
        let shape: Vec<usize> = ranges.iter().map(|range| range.len()).collect();
        let storage = match &self.storage {
            Storage::Meta => Storage::Meta,
            Storage::Dense(array) => Storage::Dense(
                array
                    .slice_each_axis(|axis| Slice::from(ranges[axis.axis.index()].clone()))
                    .to_owned(),
            ),
        };
        Ok(Self {
            storage,
            shape,
            dtype: self.dtype,
            device: self.device,
        })
    }

    /// Copies `src` into the region covered by `ranges`.
    pub fn assign_slice(&mut self, ranges: &[Range<usize>], src: &Tensor) -> Result<()> {
        self.check_ranges(ranges)?;
        let region: Vec<usize> = ranges.iter().map(|range| range.len()).collect();
        if region != src.shape {
            return Err(DistributedError::ShapeMismatch {
                expected: region,
                actual: src.shape.clone(),
            });
        }
        let src = src.data()?;
        self.data_mut()?
            .slice_each_axis_mut(|axis| Slice::from(ranges[axis.axis.index()].clone()))
            .assign(src);
        Ok(())
    }

    /// Concatenates tensors along `dim`. Empty tensors are allowed.
    pub fn cat(tensors: &[Tensor], dim: usize) -> Result<Self> {
        let first = tensors.first().ok_or(DistributedError::ShapeMismatch {
            expected: vec![1],
            actual: vec![0],
        })?;
        first.check_dim(dim)?;
        for tensor in tensors {
            let same_rest = tensor.ndim() == first.ndim()
                && (0..first.ndim()).all(|d| d == dim || tensor.shape[d] == first.shape[d]);
            if !same_rest {
                return Err(DistributedError::ShapeMismatch {
                    expected: first.shape.clone(),
                    actual: tensor.shape.clone(),
                });
            }
        }

        if tensors.iter().any(Tensor::is_meta) {
            let mut shape = first.shape.clone();
            shape[dim] = tensors.iter().map(|t| t.shape[dim]).sum();
            return Ok(Self::meta(&shape));
        }

        let views = tensors
            .iter()
            .map(|tensor| tensor.data().map(|array| array.view()))
            .collect::<Result<Vec<_>>>()?;
        let array = ndarray::concatenate(Axis(dim), &views).map_err(|_| {
            DistributedError::ShapeMismatch {
                expected: first.shape.clone(),
                actual: vec![],
            }
        })?;
        let mut tensor = Self::from_array(array, first.device);
        tensor.dtype = first.dtype;
        Ok(tensor)
    }

    fn check_dim(&self, dim: usize) -> Result<()> {
        if dim >= self.ndim() {
            return Err(DistributedError::DimOutOfRange {
                dim,
                ndim: self.ndim(),
            });
        }
        Ok(())
    }

    fn check_ranges(&self, ranges: &[Range<usize>]) -> Result<()> {
        let in_bounds = ranges.len() == self.ndim()
            && ranges
                .iter()
                .zip(&self.shape)
                .all(|(range, &size)| range.start <= range.end && range.end <= size);
        if !in_bounds {
            return Err(DistributedError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: ranges.iter().map(|range| range.end).collect(),
            });
        }
        Ok(())
    }

    fn meta_error(&self) -> DistributedError {
        DistributedError::MetaTensor {
            shape: self.shape.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange(shape: &[usize]) -> Tensor {
        let numel = shape.iter().product::<usize>();
        Tensor::from_vec((0..numel).map(|x| x as f32).collect(), shape, Device::Cpu).unwrap()
    }

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(contiguous_strides(&[3, 4]), vec![4, 1]);
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert!(contiguous_strides(&[]).is_empty());
    }

    #[test]
    fn test_narrow_and_cat_roundtrip() {
        let tensor = arange(&[3, 4]);
        let top = tensor.narrow(0, 0, 2).unwrap();
        let bottom = tensor.narrow(0, 2, 1).unwrap();
        let empty = tensor.narrow(0, 3, 0).unwrap();
        assert_eq!(top.shape(), &[2, 4]);
        assert_eq!(empty.numel(), 0);

        let cat = Tensor::cat(&[top, bottom, empty], 0).unwrap();
        assert_eq!(cat, tensor);
    }

    #[test]
    fn test_meta_tensor_has_no_data() {
        let tensor = Tensor::meta(&[2, 2]);
        assert!(tensor.is_meta());
        assert_eq!(tensor.device(), Device::Meta);
        assert!(matches!(
            tensor.data(),
            Err(DistributedError::MetaTensor { .. })
        ));
        // Moving a meta tensor is deferred
        assert!(tensor.to_device(Device::Cuda(0)).is_meta());
        let materialized = tensor.to_empty(Device::Cuda(0));
        assert_eq!(materialized.device(), Device::Cuda(0));
        assert_eq!(materialized.to_vec().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_assign_slice() {
        let mut tensor = Tensor::zeros(&[2, 3], Device::Cpu);
        let src = Tensor::full(&[2, 1], 7.0, Device::Cpu);
        tensor.assign_slice(&[0..2, 1..2], &src).unwrap();
        assert_eq!(tensor.to_vec().unwrap(), vec![0.0, 7.0, 0.0, 0.0, 7.0, 0.0]);

        let err = tensor.assign_slice(&[0..1, 1..2], &src).unwrap_err();
        assert!(matches!(err, DistributedError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_scalar_tensor() {
        let tensor = Tensor::scalar(1.0, Device::Cpu);
        assert_eq!(tensor.ndim(), 0);
        assert_eq!(tensor.numel(), 1);
        assert!(tensor.narrow(0, 0, 1).is_err());
    }

    #[test]
    fn test_to_dtype_rounds() {
        let tensor = Tensor::from_vec(vec![1.0 / 3.0], &[1], Device::Cpu).unwrap();
        let bf16 = tensor.to_dtype(DType::BF16);
        assert_eq!(bf16.dtype(), DType::BF16);
        assert_ne!(bf16.to_vec().unwrap(), tensor.to_vec().unwrap());
    }
}

use core::fmt;

use serde::{Deserialize, Serialize};

/// The kind of device a [`DeviceMesh`](crate::sharding::DeviceMesh) is made of.
///
/// Every rank of a mesh must share the same device type.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Host memory.
    Cpu,
    /// Accelerator memory.
    Cuda,
}

impl DeviceType {
    /// Returns the device this device type maps to for the given local rank.
    pub fn device(&self, local_rank: usize) -> Device {
        match self {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Cuda => Device::Cuda(local_rank),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => f.write_str("cpu"),
            DeviceType::Cuda => f.write_str("cuda"),
        }
    }
}

/// The placement of a tensor.
///
/// [`Device::Meta`] is a sentinel: a tensor on it has a known shape and dtype but no
/// backing storage. It must be materialized on a concrete device before any compute.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    /// Host memory.
    Cpu,
    /// Accelerator memory with the given ordinal.
    Cuda(usize),
    /// Size-only placement, no storage.
    Meta,
}

impl Device {
    /// The device type, or `None` for the meta sentinel.
    pub fn device_type(&self) -> Option<DeviceType> {
        match self {
            Device::Cpu => Some(DeviceType::Cpu),
            Device::Cuda(_) => Some(DeviceType::Cuda),
            Device::Meta => None,
        }
    }

    /// Whether this is the meta sentinel.
    pub fn is_meta(&self) -> bool {
        matches!(self, Device::Meta)
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
            Device::Meta => f.write_str("meta"),
        }
    }
}

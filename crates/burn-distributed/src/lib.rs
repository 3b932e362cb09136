#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn distributed computing.
//!
//! Devices (including the meta sentinel), dense local tensors, process groups and
//! collectives, device meshes and sharded tensors described by per-mesh-dimension
//! placements.

extern crate alloc;

mod collective;
mod dense;
mod device;
mod error;
mod in_process;
mod tensor;

pub mod sharding;

pub use collective::*;
pub use dense::*;
pub use device::*;
pub use error::*;
pub use in_process::*;
pub use tensor::*;

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn fully sharded data parallelism.
//!
//! Wraps modules of a [`ModuleTree`] into fully sharded units: the parameters managed by
//! each unit are split along one dimension across the ranks of a [`DeviceMesh`], and the
//! units of a tree form a root/child hierarchy set up on the first forward through the
//! root. Parameters already sharded by tensor parallelism are sharded again along the
//! data parallel dimension of the same mesh.
//!
//! [`DeviceMesh`]: burn_distributed::sharding::DeviceMesh

mod config;
mod error;
mod fully_shard;
mod managed;
mod module;
mod param;
mod param_group;
mod param_info;
mod replicate;
mod state;
mod tensor_parallel;

pub mod nn;

pub use config::*;
pub use error::*;
pub use fully_shard::*;
pub use managed::*;
pub use module::*;
pub use param::*;
pub use param_group::*;
pub use param_info::*;
pub use replicate::*;
pub use state::*;
pub use tensor_parallel::*;

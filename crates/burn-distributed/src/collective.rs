use hashbrown::HashSet;

use crate::{DistributedError, Result, Tensor};

/// An ordered set of global ranks taking part in collectives together.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ProcessGroup {
    ranks: Vec<usize>,
}

impl ProcessGroup {
    /// Creates a group without validation. Use [`Collective::new_group`] to validate
    /// against a world.
    pub fn new(ranks: Vec<usize>) -> Self {
        Self { ranks }
    }

    /// Global ranks, in group order.
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Position of a global rank in this group.
    pub fn group_rank(&self, global_rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&rank| rank == global_rank)
    }

    /// Whether the global rank belongs to this group.
    pub fn contains(&self, global_rank: usize) -> bool {
        self.group_rank(global_rank).is_some()
    }
}

/// Ordered global ranks of a process group.
pub fn get_process_group_ranks(group: &ProcessGroup) -> &[usize] {
    group.ranks()
}

/// Collective communication of the calling rank.
///
/// All ranks of a group must issue the same collectives on that group in the same order.
/// A mismatch is a hang, never a recoverable error.
pub trait Collective: Send + Sync {
    /// Global rank of the caller.
    fn rank(&self) -> usize;

    /// Number of ranks in the world.
    fn world_size(&self) -> usize;

    /// Creates a process group over `ranks`.
    fn new_group(&self, ranks: Vec<usize>) -> Result<ProcessGroup> {
        let invalid = |reason: &str| DistributedError::InvalidGroup {
            ranks: ranks.clone(),
            reason: reason.to_string(),
        };
        if ranks.is_empty() {
            return Err(invalid("a group needs at least one rank"));
        }
        if let Some(&rank) = ranks.iter().find(|&&rank| rank >= self.world_size()) {
            return Err(invalid(&format!(
                "rank {rank} exceeds world size {}",
                self.world_size()
            )));
        }
        let unique: HashSet<usize> = ranks.iter().copied().collect();
        if unique.len() != ranks.len() {
            return Err(invalid("ranks must be unique"));
        }
        Ok(ProcessGroup::new(ranks))
    }

    /// The group of every rank.
    fn world_group(&self) -> ProcessGroup {
        ProcessGroup::new((0..self.world_size()).collect())
    }

    /// Returns `src`'s tensor on every rank of the group.
    ///
    /// `src` is a global rank.
    fn broadcast(&self, tensor: &Tensor, src: usize, group: &ProcessGroup) -> Result<Tensor>;

    /// Returns every rank's tensor, in group order.
    fn all_gather(&self, tensor: &Tensor, group: &ProcessGroup) -> Result<Vec<Tensor>>;

    /// Blocks until every rank of the group reached the barrier.
    fn barrier(&self, group: &ProcessGroup) -> Result<()>;
}

pub(crate) fn check_member(rank: usize, group: &ProcessGroup) -> Result<usize> {
    group
        .group_rank(rank)
        .ok_or_else(|| DistributedError::NotInGroup {
            rank,
            ranks: group.ranks().to_vec(),
        })
}

pub(crate) fn check_materialized(tensor: &Tensor) -> Result<()> {
    if tensor.is_meta() {
        return Err(DistributedError::MetaTensor {
            shape: tensor.shape().to_vec(),
        });
    }
    Ok(())
}

/// A world made of a single rank: every collective is the identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(&self, tensor: &Tensor, src: usize, group: &ProcessGroup) -> Result<Tensor> {
        check_member(self.rank(), group)?;
        check_member(src, group)?;
        check_materialized(tensor)?;
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, group: &ProcessGroup) -> Result<Vec<Tensor>> {
        check_member(self.rank(), group)?;
        check_materialized(tensor)?;
        Ok(vec![tensor.clone()])
    }

    fn barrier(&self, group: &ProcessGroup) -> Result<()> {
        check_member(self.rank(), group)?;
        Ok(())
    }
}

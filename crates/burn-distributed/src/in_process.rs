use std::sync::{Arc, Condvar, Mutex, PoisonError};

use hashbrown::HashMap;

use crate::collective::{check_materialized, check_member};
use crate::{Collective, DistributedError, ProcessGroup, Result, Tensor};

/// Identifies one collective call: the group ranks and the per-group call index.
type CallKey = (Vec<usize>, u64);

struct Rendezvous {
    contributions: Vec<Option<Tensor>>,
    pending_readers: usize,
}

impl Rendezvous {
    fn new(size: usize) -> Self {
        Self {
            contributions: vec![None; size],
            pending_readers: size,
        }
    }

    fn is_complete(&self) -> bool {
        self.contributions.iter().all(Option::is_some)
    }
}

struct Hub {
    world_size: usize,
    calls: Mutex<HashMap<CallKey, Rendezvous>>,
    arrived: Condvar,
}

/// A world whose ranks are threads of the current process.
///
/// Every rank gets its own [`InProcessCollective`]; move each one to the thread playing
/// that rank. Collectives really exchange data between the threads.
pub struct InProcessWorld;

impl InProcessWorld {
    /// Creates the communicators of a world with `world_size` ranks, ordered by rank.
    pub fn new(world_size: usize) -> Vec<InProcessCollective> {
        let hub = Arc::new(Hub {
            world_size,
            calls: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| InProcessCollective {
                rank,
                hub: hub.clone(),
                sequence: Mutex::new(HashMap::new()),
            })
            .collect()
    }
}

/// One rank of an [`InProcessWorld`].
pub struct InProcessCollective {
    rank: usize,
    hub: Arc<Hub>,
    sequence: Mutex<HashMap<Vec<usize>, u64>>,
}

impl InProcessCollective {
    fn next_call(&self, group: &ProcessGroup) -> CallKey {
        let mut sequence = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = sequence.entry(group.ranks().to_vec()).or_insert(0);
        let call = *counter;
        *counter += 1;
        (group.ranks().to_vec(), call)
    }

    /// Deposits `tensor` and waits for every other rank of the group to do the same.
    fn exchange(&self, tensor: &Tensor, group: &ProcessGroup) -> Result<Vec<Tensor>> {
        let position = check_member(self.rank, group)?;
        if group.size() == 1 {
            return Ok(vec![tensor.clone()]);
        }

        let key = self.next_call(group);
        log::trace!(
            "rank {} entering collective #{} on group {:?}",
            self.rank,
            key.1,
            key.0
        );

        let mut calls = self.hub.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls
            .entry(key.clone())
            .or_insert_with(|| Rendezvous::new(group.size()))
            .contributions[position] = Some(tensor.clone());
        self.hub.arrived.notify_all();

        let mut calls = self
            .hub
            .arrived
            .wait_while(calls, |calls| {
                !calls.get(&key).is_some_and(Rendezvous::is_complete)
            })
            .unwrap_or_else(PoisonError::into_inner);

        let rendezvous = calls
            .get_mut(&key)
            .ok_or_else(|| DistributedError::InvalidGroup {
                ranks: group.ranks().to_vec(),
                reason: format!("collective #{} vanished before completion", key.1),
            })?;
        let gathered: Vec<Tensor> = rendezvous.contributions.iter().flatten().cloned().collect();
        rendezvous.pending_readers -= 1;
        if rendezvous.pending_readers == 0 {
            calls.remove(&key);
        }
        Ok(gathered)
    }
}

impl Collective for InProcessCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.hub.world_size
    }

    fn broadcast(&self, tensor: &Tensor, src: usize, group: &ProcessGroup) -> Result<Tensor> {
        let src_position = check_member(src, group)?;
        check_materialized(tensor)?;
        let mut gathered = self.exchange(tensor, group)?;
        let received = gathered.swap_remove(src_position);
        if received.shape() != tensor.shape() {
            return Err(DistributedError::ShapeMismatch {
                expected: tensor.shape().to_vec(),
                actual: received.shape().to_vec(),
            });
        }
        // The receive buffer keeps its own device.
        Ok(received.to_device(tensor.device()))
    }

    fn all_gather(&self, tensor: &Tensor, group: &ProcessGroup) -> Result<Vec<Tensor>> {
        check_materialized(tensor)?;
        self.exchange(tensor, group)
    }

    fn barrier(&self, group: &ProcessGroup) -> Result<()> {
        self.exchange(&Tensor::zeros(&[0], crate::Device::Cpu), group)
            .map(|_| ())
    }
}

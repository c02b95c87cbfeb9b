//! The cooperating worker group and its pass bookkeeping.
//!
//! A [`WorkerGroup`] owns the communicator for the lifetime of the process
//! group; everything else borrows it through a [`Worker`]. Collective work
//! happens inside a pass: [`Worker::begin_pass`] hands out a [`PassGuard`]
//! whose id namespaces every message tag of that pass. Only one pass may be
//! in flight at a time, and a pass dropped before [`PassGuard::finish`]
//! poisons the group.

use parking_lot::Mutex;

use crate::algs::communicator::{Communicator, Round, RoundTags};
use crate::config::RedistConfig;
use crate::redist_error::RedistError;

#[derive(Debug, Default)]
struct PassState {
    next: u32,
    active: Option<u32>,
    poisoned: Option<u32>,
}

/// Fixed-size group of cooperating workers, seen from one of them.
pub struct WorkerGroup<C: Communicator> {
    comm: C,
    config: RedistConfig,
    state: Mutex<PassState>,
}

impl<C: Communicator> WorkerGroup<C> {
    pub fn new(comm: C) -> Result<Self, RedistError> {
        Self::with_config(comm, RedistConfig::default())
    }

    pub fn with_config(comm: C, config: RedistConfig) -> Result<Self, RedistError> {
        let (rank, size) = (comm.rank(), comm.size());
        if size == 0 {
            return Err(RedistError::ZeroWorkers);
        }
        if rank >= size {
            return Err(RedistError::RankOutOfRange { rank, size });
        }
        config.validate(size)?;
        log::debug!("rank {rank}/{size}: worker group formed");
        Ok(Self {
            comm,
            config,
            state: Mutex::new(PassState::default()),
        })
    }

    /// Non-owning handle used by all pipeline stages.
    pub fn worker(&self) -> Worker<'_, C> {
        Worker { group: self }
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn config(&self) -> &RedistConfig {
        &self.config
    }

    /// Id of the pass currently in flight, if any.
    pub fn active_pass(&self) -> Option<u32> {
        self.state.lock().active
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned.is_some()
    }
}

/// Borrowed view of the group for one worker.
pub struct Worker<'g, C: Communicator> {
    group: &'g WorkerGroup<C>,
}

impl<C: Communicator> Clone for Worker<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Communicator> Copy for Worker<'_, C> {}

impl<'g, C: Communicator> Worker<'g, C> {
    #[inline]
    pub fn rank(&self) -> usize {
        self.group.comm.rank()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.group.comm.size()
    }

    #[inline]
    pub fn comm(&self) -> &'g C {
        &self.group.comm
    }

    #[inline]
    pub fn config(&self) -> &'g RedistConfig {
        &self.group.config
    }

    /// Peers in ascending rank order, excluding this worker.
    pub fn peers(&self) -> impl Iterator<Item = usize> + 'static {
        let me = self.rank();
        (0..self.size()).filter(move |&r| r != me)
    }

    /// Start a new pass. Every worker must start its passes in the same
    /// order so that pass ids agree across the group.
    pub fn begin_pass(&self) -> Result<PassGuard<'g, C>, RedistError> {
        let mut st = self.group.state.lock();
        if let Some(pass) = st.poisoned {
            return Err(RedistError::GroupPoisoned { pass });
        }
        if let Some(active) = st.active {
            return Err(RedistError::PassInFlight {
                active,
                requested: st.next,
            });
        }
        let id = st.next;
        st.next = st.next.wrapping_add(1);
        st.active = Some(id);
        log::debug!("rank {}: pass {id} begins", self.rank());
        Ok(PassGuard {
            group: self.group,
            id,
            finished: false,
        })
    }

    pub fn barrier(&self) -> Result<(), RedistError> {
        self.group.comm.barrier()
    }
}

/// Proof that a pass is active on this worker.
pub struct PassGuard<'g, C: Communicator> {
    group: &'g WorkerGroup<C>,
    id: u32,
    finished: bool,
}

impl<'g, C: Communicator> PassGuard<'g, C> {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Tag pair for `round` of this pass.
    pub fn tags(&self, round: Round) -> RoundTags {
        RoundTags::new(self.id, round)
    }

    /// Mark every round of this pass as drained.
    pub fn finish(mut self) {
        self.finished = true;
        let mut st = self.group.state.lock();
        st.active = None;
        log::debug!("rank {}: pass {} drained", self.group.comm.rank(), self.id);
    }
}

impl<C: Communicator> Drop for PassGuard<'_, C> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut st = self.group.state.lock();
        st.active = None;
        st.poisoned = Some(self.id);
        log::warn!(
            "rank {}: pass {} abandoned mid-round; worker group poisoned",
            self.group.comm.rank(),
            self.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    #[test]
    fn second_pass_is_rejected_until_first_drains() {
        let group = WorkerGroup::new(NoComm).unwrap();
        let w = group.worker();
        let a = w.begin_pass().unwrap();
        assert_eq!(a.id(), 0);
        let err = w.begin_pass().err().expect("must be rejected");
        assert!(matches!(err, RedistError::PassInFlight { active: 0, requested: 1 }));
        assert!(err.is_configuration());
        a.finish();
        let b = w.begin_pass().unwrap();
        assert_eq!(b.id(), 1);
        b.finish();
        assert_eq!(group.active_pass(), None);
    }

    #[test]
    fn abandoned_pass_poisons_group() {
        let group = WorkerGroup::new(NoComm).unwrap();
        let w = group.worker();
        drop(w.begin_pass().unwrap());
        assert!(group.is_poisoned());
        assert!(matches!(
            w.begin_pass().err(),
            Some(RedistError::GroupPoisoned { pass: 0 })
        ));
    }

    #[test]
    fn rejects_bad_topology() {
        assert!(matches!(
            WorkerGroup::new(RayonComm::on_mailbox(0, 0, Default::default())).err(),
            Some(RedistError::ZeroWorkers)
        ));
        assert!(matches!(
            WorkerGroup::new(RayonComm::on_mailbox(3, 2, Default::default())).err(),
            Some(RedistError::RankOutOfRange { rank: 3, size: 2 })
        ));
    }

    #[test]
    fn peers_exclude_self() {
        let world = RayonComm::world(4);
        let group = WorkerGroup::new(world[2].clone()).unwrap();
        assert_eq!(group.worker().peers().collect::<Vec<_>>(), vec![0, 1, 3]);
    }
}

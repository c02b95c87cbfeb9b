//! Thin façade over single-worker, intra-process (threads) or inter-process
//! (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking to post: the exchange code
//! calls `.wait()` before it trusts that a buffer is ready, and it always
//! drains every handle it posted, even on error.
//!
//! Tags are structured: a [`CommTag`] names the pass, the round inside the
//! pass and the channel inside the round. Two exchanges that could be in
//! flight at the same time never share a tag.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::redist_error::RedistError;

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Post a send of `buf` to `peer` on `tag`.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive from `peer` on `tag`; `buf.len()` is the expected size.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Rank of this worker.
    fn rank(&self) -> usize;
    /// Number of workers in the group.
    fn size(&self) -> usize;

    /// Fallible variant of [`isend`](Self::isend) for backends that can
    /// refuse a send up front.
    fn isend_result(
        &self,
        peer: usize,
        tag: u16,
        buf: &[u8],
    ) -> Result<Self::SendHandle, RedistError> {
        Ok(self.isend(peer, tag, buf))
    }

    /// Fallible variant of [`irecv`](Self::irecv).
    fn irecv_result(
        &self,
        peer: usize,
        tag: u16,
        buf: &mut [u8],
    ) -> Result<Self::RecvHandle, RedistError> {
        Ok(self.irecv(peer, tag, buf))
    }

    /// Block until every worker has reached the barrier.
    ///
    /// The default is a gather/release through rank 0 on [`BARRIER_TAG`].
    fn barrier(&self) -> Result<(), RedistError> {
        let (rank, size) = (self.rank(), self.size());
        if size <= 1 {
            return Ok(());
        }
        let mut token = [0u8; 1];
        if rank == 0 {
            for peer in 1..size {
                if self.irecv_result(peer, BARRIER_TAG, &mut token)?.wait().is_none() {
                    return Err(RedistError::comm(peer, "barrier arrival lost"));
                }
            }
            for peer in 1..size {
                let _ = self.isend_result(peer, BARRIER_TAG, &[1])?.wait();
            }
        } else {
            let _ = self.isend_result(0, BARRIER_TAG, &[1])?.wait();
            if self.irecv_result(0, BARRIER_TAG, &mut token)?.wait().is_none() {
                return Err(RedistError::comm(0, "barrier release lost"));
            }
        }
        Ok(())
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    ///
    /// Sends return `None`. A receive returning `None` has failed.
    fn wait(self) -> Option<Vec<u8>>;
}

/// Tag reserved for the default barrier; never produced by [`CommTag`].
pub const BARRIER_TAG: u16 = 0x7FFF;

/// Round of a pass. Each round owns its own tag pair.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Round {
    /// Per-worker weight totals feeding the partitioner.
    Totals = 0,
    /// Moved items.
    Transfer = 1,
    /// Ghost copies.
    Replicate = 2,
    /// Region keys for global id reconciliation.
    Reconcile = 3,
    /// Statistic reduction to a root.
    Reduce = 4,
    /// Root-to-all broadcast.
    Broadcast = 5,
    /// Range reduction ahead of histogram binning.
    RangeReduce = 6,
    /// Broadcast of the reduced range.
    RangeBroadcast = 7,
    /// Post-pass partition verification: item counts.
    Verify = 8,
    /// Post-pass partition verification: origin keys.
    VerifyOrigins = 9,
    /// Histogram bin counts reduced to the root.
    HistogramCounts = 10,
}

/// Channel inside a round.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Byte length of the body that follows.
    Len = 0,
    /// Message body.
    Body = 1,
}

/// Structured message tag: `(pass, round, channel)`.
///
/// Encoded as `pass << 7 | round << 3 | channel`, which stays within the
/// 15-bit range every MPI implementation guarantees for tags.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag {
    pub pass: u8,
    pub round: Round,
    pub channel: Channel,
}

impl CommTag {
    pub const fn new(pass: u32, round: Round, channel: Channel) -> Self {
        Self {
            pass: (pass & 0xFF) as u8,
            round,
            channel,
        }
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        ((self.pass as u16) << 7) | ((self.round as u16) << 3) | (self.channel as u16)
    }
}

/// Length/body tag pair for one round of one pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RoundTags {
    pub len: CommTag,
    pub body: CommTag,
}

impl RoundTags {
    pub const fn new(pass: u32, round: Round) -> Self {
        Self {
            len: CommTag::new(pass, round, Channel::Len),
            body: CommTag::new(pass, round, Channel::Body),
        }
    }
}

/// Compile-time no-op comm for single-worker groups and serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

// --- RayonComm: intra-process / multi-thread ---

type Key = (usize, usize, u16); // (src, dst, tag)

/// Shared message store for a group of [`RayonComm`] endpoints.
///
/// One FIFO queue per `(src, dst, tag)` channel.
#[derive(Debug, Default)]
pub struct Mailbox {
    queues: DashMap<Key, VecDeque<Bytes>>,
    closed: AtomicBool,
}

impl Mailbox {
    fn push(&self, key: Key, data: Bytes) {
        self.queues.entry(key).or_default().push_back(data);
    }

    fn pop(&self, key: &Key) -> Option<Bytes> {
        self.queues.get_mut(key).and_then(|mut q| q.pop_front())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of undelivered messages across all channels.
    pub fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }
}

const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Receive handle of [`RayonComm`]; polls the mailbox on `wait`.
pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
    timeout: Duration,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let start = Instant::now();
        let mut spins = 0u32;
        loop {
            if let Some(bytes) = self.mailbox.pop(&self.key) {
                return Some(bytes.to_vec());
            }
            if self.mailbox.is_closed() || start.elapsed() >= self.timeout {
                log::debug!(
                    "receive {}->{} tag {:#06x} gave up (closed: {})",
                    self.key.0,
                    self.key.1,
                    self.key.2,
                    self.mailbox.is_closed()
                );
                return None;
            }
            if spins < 64 {
                spins += 1;
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
    }
}

/// In-process communicator: one endpoint per worker thread.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
    timeout: Duration,
}

impl RayonComm {
    /// Endpoint `rank` of a `size`-worker group on an existing mailbox.
    /// Endpoints only see each other when they share the same mailbox.
    pub fn on_mailbox(rank: usize, size: usize, mailbox: Arc<Mailbox>) -> Self {
        Self {
            rank,
            size,
            mailbox,
            timeout: DEFAULT_RECV_TIMEOUT,
        }
    }

    /// `size` endpoints sharing a fresh private mailbox, indexed by rank.
    pub fn world(size: usize) -> Vec<Self> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| Self::on_mailbox(rank, size, mailbox.clone()))
            .collect()
    }

    /// Override how long a receive waits before reporting failure.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shut the shared mailbox down; every pending and future receive fails.
    pub fn close(&self) {
        self.mailbox.closed.store(true, Ordering::Release);
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.mailbox
            .push((self.rank, peer, tag), Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> Self::RecvHandle {
        LocalHandle {
            mailbox: self.mailbox.clone(),
            key: (peer, self.rank, tag),
            timeout: self.timeout,
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend_result(
        &self,
        peer: usize,
        tag: u16,
        buf: &[u8],
    ) -> Result<Self::SendHandle, RedistError> {
        if peer >= self.size {
            return Err(RedistError::RankOutOfRange {
                rank: peer,
                size: self.size,
            });
        }
        if self.mailbox.is_closed() {
            return Err(RedistError::comm(peer, "mailbox closed"));
        }
        Ok(self.isend(peer, tag, buf))
    }

    fn irecv_result(
        &self,
        peer: usize,
        tag: u16,
        buf: &mut [u8],
    ) -> Result<Self::RecvHandle, RedistError> {
        if peer >= self.size {
            return Err(RedistError::RankOutOfRange {
                rank: peer,
                size: self.size,
            });
        }
        Ok(self.irecv(peer, tag, buf))
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::collective::CommunicatorCollectives as _;
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination as _, Source as _};
    use mpi::request::StaticScope;
    use mpi::topology::{Communicator as _, SimpleCommunicator};

    /// MPI world communicator. Owns the MPI environment: dropping the last
    /// `MpiComm` finalizes MPI.
    pub struct MpiComm {
        world: Arc<SimpleCommunicator>,
        rank: usize,
        size: usize,
        _universe: Arc<Universe>,
    }

    // Workers drive MPI from a single thread of control each.
    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        pub fn new() -> Result<Self, RedistError> {
            let universe = mpi::initialize()
                .ok_or_else(|| RedistError::InvalidConfig("MPI already initialized".into()))?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                world: Arc::new(world),
                rank,
                size,
                _universe: Arc::new(universe),
            })
        }
    }

    /// Completes an immediate send and releases its buffer.
    pub struct MpiSendHandle(Box<dyn FnOnce()>);

    impl Wait for MpiSendHandle {
        fn wait(self) -> Option<Vec<u8>> {
            (self.0)();
            None
        }
    }

    /// Deferred blocking receive; matched when waited.
    pub struct MpiRecvHandle {
        world: Arc<SimpleCommunicator>,
        peer: i32,
        tag: i32,
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let (data, _status) = self
                .world
                .process_at_rank(self.peer)
                .receive_vec_with_tag::<u8>(self.tag);
            Some(data)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let raw: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: `raw` stays allocated until the request has completed.
            let leaked: &'static [u8] = unsafe { &*raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, leaked, tag as i32);
            MpiSendHandle(Box::new(move || {
                req.wait();
                // SAFETY: the request is complete; nobody else references `raw`.
                unsafe { drop(Box::from_raw(raw)) };
            }))
        }

        fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> MpiRecvHandle {
            MpiRecvHandle {
                world: self.world.clone(),
                peer: peer as i32,
                tag: tag as i32,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn barrier(&self) -> Result<(), RedistError> {
            self.world.barrier();
            Ok(())
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rayon_roundtrip_two_ranks() {
        let world = RayonComm::world(2);
        let (comm0, comm1) = (&world[0], &world[1]);

        let mut recv_buf = [0u8; 4];
        let recv_handle = comm1.irecv(0, 7, &mut recv_buf);
        comm0.isend(1, 7, &[1, 2, 3, 4]).wait();

        let data = recv_handle
            .wait()
            .expect("Expected to receive data from rank 0");
        recv_buf.copy_from_slice(&data);
        assert_eq!(&recv_buf, &[1, 2, 3, 4]);
    }

    #[test]
    fn separate_worlds_do_not_share_queues() {
        let a = RayonComm::world(2);
        let b: Vec<_> = RayonComm::world(2)
            .into_iter()
            .map(|c| c.with_timeout(Duration::from_millis(50)))
            .collect();
        a[0].isend(1, 3, &[9]).wait();
        assert!(b[1].irecv(0, 3, &mut []).wait().is_none());
        assert_eq!(a[0].mailbox().pending(), 1);
        assert_eq!(b[0].mailbox().pending(), 0);
    }

    #[test]
    fn tags_are_distinct_per_round_and_channel() {
        let mut seen = std::collections::HashSet::new();
        for pass in [0u32, 1, 255] {
            for round in [
                Round::Totals,
                Round::Transfer,
                Round::Replicate,
                Round::Reconcile,
                Round::Reduce,
                Round::Broadcast,
                Round::RangeReduce,
                Round::RangeBroadcast,
                Round::Verify,
                Round::VerifyOrigins,
                Round::HistogramCounts,
            ] {
                let t = RoundTags::new(pass, round);
                assert!(seen.insert(t.len.as_u16()));
                assert!(seen.insert(t.body.as_u16()));
            }
        }
        assert!(!seen.contains(&BARRIER_TAG));
        assert!(seen.iter().all(|&t| t <= 0x7FFF));
    }

    #[test]
    fn pass_id_wraps_into_tag() {
        assert_eq!(
            CommTag::new(256 + 3, Round::Transfer, Channel::Body),
            CommTag::new(3, Round::Transfer, Channel::Body)
        );
    }

    #[test]
    fn closed_mailbox_fails_receive() {
        let world = RayonComm::world(2);
        world[0].close();
        let mut buf = [0u8; 1];
        assert!(world[1].irecv(0, 1, &mut buf).wait().is_none());
        assert!(world[0].isend_result(1, 1, &[0]).unwrap_err().is_transport());
    }

    #[test]
    fn barrier_releases_all() {
        let world = RayonComm::world(3);
        std::thread::scope(|s| {
            for comm in &world {
                s.spawn(move || comm.barrier().unwrap());
            }
        });
        assert_eq!(world[0].mailbox().pending(), 0);
    }
}

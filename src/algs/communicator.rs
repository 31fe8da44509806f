//! Thin façade over in-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking: the scatter engine posts
//! them in `begin` and calls `.wait()` in `end` before it trusts the data.
//!
//! The collectives (`barrier`, `allreduce_and`, `allreduce_sum`, `broadcast`,
//! `gather`) have default implementations written on top of `isend`/`irecv`
//! with tags from [`COLLECTIVE_TAG_BASE`] upward. Backends with native
//! collectives override them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::Bytes;
use dashmap::DashMap;

use crate::algs::wire::{WireCount, cast_slice, cast_slice_mut};

/// Tags at or above this value belong to the provided collectives.
pub const COLLECTIVE_TAG_BASE: u16 = 0xF000;
/// First tag handed out by [`Communicator::reserve_tag_range`].
pub const FIRST_USER_TAG: u16 = 0x0100;

const TAG_GATHER_COUNT: u16 = COLLECTIVE_TAG_BASE;
const TAG_GATHER_DATA: u16 = COLLECTIVE_TAG_BASE + 1;
const TAG_BCAST_COUNT: u16 = COLLECTIVE_TAG_BASE + 2;
const TAG_BCAST_DATA: u16 = COLLECTIVE_TAG_BASE + 3;

/// A typed message tag; plans reserve a contiguous range of these.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        CommTag(tag)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// The `k`-th tag of a reserved range.
    pub const fn offset(self, k: u16) -> Self {
        CommTag(self.0.wrapping_add(k))
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Non-blocking communication interface plus the handful of collectives the
/// scatter engine needs.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// `buf.len()` is the number of bytes expected. The thread backend hands
    /// back whatever was sent, so callers compare the length themselves.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Reserve `n` consecutive tags. Collective: every rank must reserve the
    /// same ranges in the same order.
    fn reserve_tag_range(&self, n: u16) -> CommTag;

    fn is_no_comm(&self) -> bool {
        false
    }

    fn barrier(&self) {
        let _ = self.allreduce_and(true);
    }

    /// Logical AND of `flag` over the whole group.
    fn allreduce_and(&self, flag: bool) -> bool {
        let gathered = self.gather(0, &[flag as u8]);
        let mut out = vec![0u8];
        if let Some(chunks) = gathered {
            out[0] = chunks.iter().all(|c| c.first() == Some(&1)) as u8;
        }
        self.broadcast(0, &mut out);
        out.first() == Some(&1)
    }

    /// Element-wise global sum, in place.
    fn allreduce_sum(&self, vals: &mut [u64]) {
        let local: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut out = Vec::new();
        if let Some(chunks) = self.gather(0, &local) {
            let mut acc = vec![0u64; vals.len()];
            for chunk in &chunks {
                for (slot, word) in acc.iter_mut().zip(chunk.chunks_exact(8)) {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(word);
                    *slot = slot.wrapping_add(u64::from_le_bytes(b));
                }
            }
            out = acc.iter().flat_map(|v| v.to_le_bytes()).collect();
        }
        self.broadcast(0, &mut out);
        for (v, word) in vals.iter_mut().zip(out.chunks_exact(8)) {
            let mut b = [0u8; 8];
            b.copy_from_slice(word);
            *v = u64::from_le_bytes(b);
        }
    }

    /// Replace `buf` on every rank with the root's `buf`.
    fn broadcast(&self, root: usize, buf: &mut Vec<u8>) {
        let me = self.rank();
        if me == root {
            let count = WireCount::new(buf.len());
            let mut pending = Vec::with_capacity(2 * self.size());
            for peer in (0..self.size()).filter(|&p| p != root) {
                pending.push(self.isend(peer, TAG_BCAST_COUNT, cast_slice(std::slice::from_ref(&count))));
                pending.push(self.isend(peer, TAG_BCAST_DATA, buf));
            }
            for send in pending {
                let _ = send.wait();
            }
        } else {
            let len = recv_count(self, root, TAG_BCAST_COUNT);
            let mut data = vec![0u8; len];
            let raw = self.irecv(root, TAG_BCAST_DATA, &mut data).wait();
            *buf = raw.unwrap_or(data);
        }
    }

    /// Collect every rank's `local` bytes on `root`, in rank order.
    /// Returns `None` on every other rank.
    fn gather(&self, root: usize, local: &[u8]) -> Option<Vec<Vec<u8>>> {
        let me = self.rank();
        if me != root {
            let count = WireCount::new(local.len());
            let s1 = self.isend(root, TAG_GATHER_COUNT, cast_slice(std::slice::from_ref(&count)));
            let s2 = self.isend(root, TAG_GATHER_DATA, local);
            let _ = s1.wait();
            let _ = s2.wait();
            return None;
        }
        let mut out = Vec::with_capacity(self.size());
        for peer in 0..self.size() {
            if peer == me {
                out.push(local.to_vec());
                continue;
            }
            let len = recv_count(self, peer, TAG_GATHER_COUNT);
            let mut data = vec![0u8; len];
            let raw = self.irecv(peer, TAG_GATHER_DATA, &mut data).wait();
            out.push(raw.unwrap_or(data));
        }
        Some(out)
    }
}

fn recv_count<C: Communicator + ?Sized>(comm: &C, peer: usize, tag: u16) -> usize {
    let mut cnt = WireCount::new(0);
    let raw = comm
        .irecv(peer, tag, cast_slice_mut(std::slice::from_mut(&mut cnt)))
        .wait();
    if let Some(data) = raw {
        if data.len() == std::mem::size_of::<WireCount>() {
            cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&data);
        }
    }
    cnt.get()
}

fn bump_tag(counter: &AtomicU16, n: u16) -> CommTag {
    let mut cur = counter.load(Ordering::Relaxed);
    loop {
        let start = match cur.checked_add(n) {
            Some(end) if end < COLLECTIVE_TAG_BASE => cur,
            _ => FIRST_USER_TAG,
        };
        match counter.compare_exchange(cur, start + n, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return CommTag(start),
            Err(actual) => cur = actual,
        }
    }
}

/// Compile-time no-op comm for pure serial use: one rank, no messages.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

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
    fn reserve_tag_range(&self, _n: u16) -> CommTag {
        CommTag(FIRST_USER_TAG)
    }
    fn is_no_comm(&self) -> bool {
        true
    }
    fn barrier(&self) {}
    fn allreduce_and(&self, flag: bool) -> bool {
        flag
    }
    fn allreduce_sum(&self, _vals: &mut [u64]) {}
    fn broadcast(&self, _root: usize, _buf: &mut Vec<u8>) {}
    fn gather(&self, _root: usize, local: &[u8]) -> Option<Vec<Vec<u8>>> {
        Some(vec![local.to_vec()])
    }
}

// --- ThreadComm: ranks are threads of one process ---
type Key = (usize, usize, u16); // (src, dst, tag)
type Mailbox = DashMap<Key, VecDeque<Bytes>>;

/// Group member whose peers are other threads of the same process.
///
/// Messages are matched FIFO per `(src, dst, tag)` when the receive handle is
/// waited on. Create a whole group at once with [`ThreadComm::group`] and move
/// one member into each thread.
#[derive(Clone, Debug)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
    next_tag: Arc<AtomicU16>,
}

impl ThreadComm {
    /// One communicator per rank, all sharing a mailbox.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let mailbox = Arc::new(Mailbox::new());
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
                next_tag: Arc::new(AtomicU16::new(FIRST_USER_TAG)),
            })
            .collect()
    }

    /// Number of messages posted but not yet received (all ranks).
    pub fn in_flight(&self) -> usize {
        self.mailbox.iter().map(|e| e.value().len()).sum()
    }
}

/// Receive handle of [`ThreadComm`].
pub struct ThreadRecv {
    mailbox: Arc<Mailbox>,
    key: Key,
}

impl Wait for ThreadRecv {
    fn wait(self) -> Option<Vec<u8>> {
        loop {
            if let Some(mut queue) = self.mailbox.get_mut(&self.key) {
                if let Some(bytes) = queue.pop_front() {
                    return Some(bytes.to_vec());
                }
            }
            std::thread::yield_now();
        }
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ();
    type RecvHandle = ThreadRecv;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        let key = (self.rank, peer, tag);
        self.mailbox
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> ThreadRecv {
        ThreadRecv {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn reserve_tag_range(&self, n: u16) -> CommTag {
        bump_tag(&self.next_tag, n)
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::collective::SystemOperation;
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// World communicator. Keeps the MPI environment alive while any clone exists.
    #[derive(Clone)]
    pub struct MpiComm {
        universe: Arc<Universe>,
        rank: usize,
        size: usize,
        next_tag: Arc<AtomicU16>,
    }

    // SAFETY: MPI is initialized with `Threading::Multiple`, which permits calls
    // from any thread.
    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        pub fn new() -> Option<Self> {
            let (universe, _threading) =
                mpi::initialize_with_threading(mpi::Threading::Multiple)?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Some(Self {
                universe: Arc::new(universe),
                rank,
                size,
                next_tag: Arc::new(AtomicU16::new(FIRST_USER_TAG)),
            })
        }

        fn world(&self) -> SimpleCommunicator {
            self.universe.world()
        }
    }

    /// Pending send; owns its buffer until completion.
    pub struct MpiSend {
        req: Request<'static, [u8], StaticScope>,
        data: *mut [u8],
    }

    impl Wait for MpiSend {
        fn wait(self) -> Option<Vec<u8>> {
            self.req.wait();
            // SAFETY: `data` came from `Box::leak` in `isend` and the request
            // that borrowed it has completed.
            drop(unsafe { Box::from_raw(self.data) });
            None
        }
    }

    /// Pending receive; owns its buffer until completion.
    pub struct MpiRecv {
        req: Request<'static, [u8], StaticScope>,
        data: *mut [u8],
    }

    impl Wait for MpiRecv {
        fn wait(self) -> Option<Vec<u8>> {
            self.req.wait();
            // SAFETY: as for `MpiSend`; the receive has completed.
            let owned = unsafe { Box::from_raw(self.data) };
            Some(owned.into_vec())
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSend;
        type RecvHandle = MpiRecv;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSend {
            let leaked: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let data: *mut [u8] = leaked;
            // SAFETY: the pointer stays valid until `MpiSend::wait` reclaims it.
            let view: &'static [u8] = unsafe { &*data };
            let req = self
                .world()
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, view, tag as i32);
            MpiSend { req, data }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiRecv {
            let leaked: &'static mut [u8] = Box::leak(vec![0u8; buf.len()].into_boxed_slice());
            let data: *mut [u8] = leaked;
            // SAFETY: see `isend`.
            let view: &'static mut [u8] = unsafe { &mut *data };
            let req = self
                .world()
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, view, tag as i32);
            MpiRecv { req, data }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn reserve_tag_range(&self, n: u16) -> CommTag {
            bump_tag(&self.next_tag, n)
        }

        fn barrier(&self) {
            self.world().barrier();
        }

        fn allreduce_and(&self, flag: bool) -> bool {
            let mut out = false;
            self.world()
                .all_reduce_into(&flag, &mut out, SystemOperation::logical_and());
            out
        }

        fn allreduce_sum(&self, vals: &mut [u64]) {
            let local = vals.to_vec();
            self.world()
                .all_reduce_into(&local[..], vals, SystemOperation::sum());
        }

        fn broadcast(&self, root: usize, buf: &mut Vec<u8>) {
            let world = self.world();
            let root_proc = world.process_at_rank(root as i32);
            let mut len = buf.len() as u64;
            root_proc.broadcast_into(&mut len);
            buf.resize(len as usize, 0);
            root_proc.broadcast_into(&mut buf[..]);
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_roundtrip_two_ranks() {
        let comms = ThreadComm::group(2);

        let mut recv_buf = [0u8; 4];
        let recv_handle = comms[1].irecv(0, 7, &mut recv_buf);
        comms[0].isend(1, 7, &[1, 2, 3, 4]).wait();

        let data = recv_handle.wait().expect("Expected to receive data from rank 0");
        recv_buf.copy_from_slice(&data);
        assert_eq!(&recv_buf, &[1, 2, 3, 4]);
    }

    #[test]
    fn groups_do_not_share_mailboxes() {
        let a = ThreadComm::group(2);
        let b = ThreadComm::group(2);
        a[0].isend(1, 3, &[9]);
        assert_eq!(a[0].in_flight(), 1);
        assert_eq!(b[0].in_flight(), 0);
        let mut buf = [0u8; 1];
        assert_eq!(a[1].irecv(0, 3, &mut buf).wait(), Some(vec![9]));
    }

    #[test]
    fn tag_ranges_are_disjoint_and_wrap() {
        let counter = AtomicU16::new(FIRST_USER_TAG);
        let t0 = bump_tag(&counter, 5);
        let t1 = bump_tag(&counter, 5);
        assert_eq!(t0.as_u16(), FIRST_USER_TAG);
        assert_eq!(t1.as_u16(), FIRST_USER_TAG + 5);

        counter.store(COLLECTIVE_TAG_BASE - 2, Ordering::Relaxed);
        let wrapped = bump_tag(&counter, 5);
        assert_eq!(wrapped.as_u16(), FIRST_USER_TAG);
    }

    #[test]
    fn no_comm_collectives_are_identity() {
        let comm = NoComm;
        assert!(comm.allreduce_and(true));
        assert!(!comm.allreduce_and(false));
        let mut v = [3u64, 4];
        comm.allreduce_sum(&mut v);
        assert_eq!(v, [3, 4]);
        assert_eq!(comm.gather(0, &[1, 2]), Some(vec![vec![1, 2]]));
    }
}

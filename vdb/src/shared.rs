//! Shared transport state.
//!
//! One anonymous `MAP_SHARED` mapping holds everything the producer and the
//! worker processes need to see: lifecycle flags, the swap bookkeeping, the
//! two swap buffers and the supervisor's receive buffer. Forked workers
//! inherit the mapping, so every process sees the same bytes at the same
//! address.
//!
//! ```text
//! +--------+----------------+----------------+----------------+
//! | Header | buffer 0       | buffer 1       | receive buffer |
//! +--------+----------------+----------------+----------------+
//! ```
//!
//! Every header field is an atomic. The buffers themselves are plain bytes;
//! exclusive access to them follows from the swap protocol, never from locks.

use crossbeam_utils::CachePadded;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};

use crate::error::{Result, TransportError};

const BUFFER_ALIGN: usize = 64;

/// Worker and connection lifecycle flags.
///
/// Each flag has exactly one writer at a time: the process that owns the
/// phase it describes (or the process that claimed it on that owner's behalf
/// right before spawning it).
#[repr(C)]
#[derive(Default)]
pub struct Lifecycle {
    pub has_recv_worker: AtomicBool,
    pub has_send_worker: AtomicBool,
    pub has_connection: AtomicBool,
    pub session_closed: AtomicBool,
    /// Pid of the current sender, 0 if none has been recorded.
    pub send_worker_pid: AtomicI32,
}

/// Producer-owned swap bookkeeping.
#[repr(C)]
#[derive(Default)]
pub struct SwapState {
    /// A published buffer has not been acknowledged by the sender yet.
    pub busy: AtomicBool,
    /// Index (0 or 1) of the buffer the producer writes into.
    pub work_index: AtomicUsize,
    /// Bytes written into the current work buffer.
    pub work_buffer_used: AtomicUsize,
    /// Bytes handed to the sender at the last swap.
    pub bytes_to_send: AtomicUsize,
    /// The sender consumed a ready token and has not signaled done yet.
    pub in_flight: AtomicBool,
}

/// Transport counters, updated with relaxed ordering.
#[repr(C)]
#[derive(Default)]
pub struct Counters {
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub handoffs_published: AtomicU64,
    pub cycles_coalesced: AtomicU64,
    pub appends_dropped: AtomicU64,
    pub bytes_dropped: AtomicU64,
    pub connections: AtomicU64,
    pub disconnects: AtomicU64,
}

/// Layout of the start of the shared region.
///
/// Zero bytes are a valid initial value for every field, which is what a
/// fresh anonymous mapping contains.
#[repr(C)]
#[derive(Default)]
pub struct Header {
    pub lifecycle: CachePadded<Lifecycle>,
    pub swap: CachePadded<SwapState>,
    pub counters: CachePadded<Counters>,
}

/// Point-in-time copy of the transport counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub handoffs_published: u64,
    pub cycles_coalesced: u64,
    pub appends_dropped: u64,
    pub bytes_dropped: u64,
    pub connections: u64,
    pub disconnects: u64,
}

/// Handle to the shared region.
///
/// Created once by the session bootstrap and inherited (not re-created) by
/// every forked worker.
pub struct SharedState {
    base: NonNull<u8>,
    len: usize,
    work_capacity: usize,
    recv_capacity: usize,
}

// SAFETY: all header access goes through atomics, and buffer access is
// partitioned between processes/threads by the swap protocol.
unsafe impl Send for SharedState {}
unsafe impl Sync for SharedState {}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl SharedState {
    /// Map a zero-initialized region for the given buffer capacities.
    pub fn create(work_capacity: usize, recv_capacity: usize) -> Result<Self> {
        if work_capacity == 0 || recv_capacity == 0 {
            return Err(TransportError::Config(
                "buffer capacities must be non-zero".to_string(),
            ));
        }

        let len = Self::buffers_offset()
            + 2 * align_up(work_capacity, BUFFER_ALIGN)
            + align_up(recv_capacity, BUFFER_ALIGN);

        // SAFETY: anonymous mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(TransportError::SharedMemory(io::Error::last_os_error()));
        }

        let base = NonNull::new(ptr as *mut u8).ok_or_else(|| {
            TransportError::SharedMemory(io::Error::other("mmap returned null"))
        })?;

        Ok(Self {
            base,
            len,
            work_capacity,
            recv_capacity,
        })
    }

    fn buffers_offset() -> usize {
        align_up(std::mem::size_of::<Header>(), BUFFER_ALIGN)
    }

    #[inline]
    pub fn header(&self) -> &Header {
        // SAFETY: the mapping is page aligned, at least header-sized, and
        // zeroed memory is a valid `Header`.
        unsafe { &*(self.base.as_ptr() as *const Header) }
    }

    #[inline]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.header().lifecycle
    }

    #[inline]
    pub fn swap(&self) -> &SwapState {
        &self.header().swap
    }

    #[inline]
    pub fn counters(&self) -> &Counters {
        &self.header().counters
    }

    /// Capacity of each work/send buffer.
    pub fn work_capacity(&self) -> usize {
        self.work_capacity
    }

    pub fn recv_capacity(&self) -> usize {
        self.recv_capacity
    }

    /// Total size of the mapping.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn buffer_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < 2);
        let offset = Self::buffers_offset() + index * align_up(self.work_capacity, BUFFER_ALIGN);
        // SAFETY: offset is within the mapping by construction in `create`.
        unsafe { self.base.as_ptr().add(offset) }
    }

    fn recv_ptr(&self) -> *mut u8 {
        let offset = Self::buffers_offset() + 2 * align_up(self.work_capacity, BUFFER_ALIGN);
        // SAFETY: as above.
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Index of the buffer currently receiving producer writes.
    pub fn work_index(&self) -> usize {
        self.swap().work_index.load(Ordering::Acquire) & 1
    }

    /// Index of the buffer currently owned by the sender.
    pub fn send_index(&self) -> usize {
        self.work_index() ^ 1
    }

    /// Copy `bytes` into the work buffer at `offset`.
    ///
    /// # Safety
    ///
    /// Only the producer may call this, and `offset + bytes.len()` must not
    /// exceed the work capacity.
    pub(crate) unsafe fn write_work(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.work_capacity);
        let dst = unsafe { self.buffer_ptr(self.work_index()).add(offset) };
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
    }

    /// The first `bytes_to_send` bytes of the send buffer.
    ///
    /// # Safety
    ///
    /// Only the sender may call this, and only between consuming a ready
    /// token and signaling done; the producer does not touch the send buffer
    /// in that window.
    pub(crate) unsafe fn send_payload(&self) -> &[u8] {
        let len = self
            .swap()
            .bytes_to_send
            .load(Ordering::Acquire)
            .min(self.work_capacity);
        unsafe { std::slice::from_raw_parts(self.buffer_ptr(self.send_index()), len) }
    }

    /// The supervisor's receive buffer.
    ///
    /// # Safety
    ///
    /// Only the supervisor may call this, and it must not hold two of the
    /// returned slices at once.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn recv_buffer(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.recv_ptr(), self.recv_capacity) }
    }

    /// Copy of the bytes last handed to the sender.
    pub fn send_buffer_snapshot(&self) -> Vec<u8> {
        // SAFETY: read-only copy; callers use this for inspection while no
        // swap is in progress.
        unsafe { self.send_payload().to_vec() }
    }

    /// Copy of the bytes written into the work buffer so far.
    pub fn work_buffer_snapshot(&self) -> Vec<u8> {
        let used = self
            .swap()
            .work_buffer_used
            .load(Ordering::Acquire)
            .min(self.work_capacity);
        // SAFETY: read-only copy of the producer's own buffer.
        unsafe { std::slice::from_raw_parts(self.buffer_ptr(self.work_index()), used).to_vec() }
    }

    pub fn stats(&self) -> TransportStats {
        let c = self.counters();
        TransportStats {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            handoffs_published: c.handoffs_published.load(Ordering::Relaxed),
            cycles_coalesced: c.cycles_coalesced.load(Ordering::Relaxed),
            appends_dropped: c.appends_dropped.load(Ordering::Relaxed),
            bytes_dropped: c.bytes_dropped.load(Ordering::Relaxed),
            connections: c.connections.load(Ordering::Relaxed),
            disconnects: c.disconnects.load(Ordering::Relaxed),
        }
    }

    // Lifecycle helpers

    /// Atomically claim the receive-worker slot. Returns false if it was
    /// already taken.
    pub fn claim_recv_worker(&self) -> bool {
        self.lifecycle()
            .has_recv_worker
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_recv_worker(&self) {
        self.lifecycle().has_recv_worker.store(false, Ordering::Release);
    }

    pub fn has_recv_worker(&self) -> bool {
        self.lifecycle().has_recv_worker.load(Ordering::Acquire)
    }

    /// Atomically claim the send-worker slot. Returns false if it was
    /// already taken.
    pub fn claim_send_worker(&self) -> bool {
        self.lifecycle()
            .has_send_worker
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_send_worker(&self) {
        self.lifecycle().has_send_worker.store(false, Ordering::Release);
    }

    pub fn has_send_worker(&self) -> bool {
        self.lifecycle().has_send_worker.load(Ordering::Acquire)
    }

    pub fn set_send_worker_pid(&self, pid: i32) {
        self.lifecycle().send_worker_pid.store(pid, Ordering::Release);
    }

    pub fn send_worker_pid(&self) -> i32 {
        self.lifecycle().send_worker_pid.load(Ordering::Acquire)
    }

    pub fn has_connection(&self) -> bool {
        self.lifecycle().has_connection.load(Ordering::Acquire)
    }

    pub fn set_connection(&self, connected: bool) {
        self.lifecycle()
            .has_connection
            .store(connected, Ordering::Release);
    }

    pub fn is_session_closed(&self) -> bool {
        self.lifecycle().session_closed.load(Ordering::Acquire)
    }

    pub fn close_session(&self) {
        self.lifecycle().session_closed.store(true, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.swap().busy.load(Ordering::Acquire)
    }

    pub fn work_buffer_used(&self) -> usize {
        self.swap().work_buffer_used.load(Ordering::Acquire)
    }

    pub fn bytes_to_send(&self) -> usize {
        self.swap().bytes_to_send.load(Ordering::Acquire)
    }

    pub fn set_in_flight(&self, in_flight: bool) {
        self.swap().in_flight.store(in_flight, Ordering::Release);
    }

    pub fn is_in_flight(&self) -> bool {
        self.swap().in_flight.load(Ordering::Acquire)
    }

    /// Clear the in-flight mark, returning whether it was set.
    pub fn take_in_flight(&self) -> bool {
        self.swap().in_flight.swap(false, Ordering::AcqRel)
    }
}

impl Drop for SharedState {
    fn drop(&mut self) {
        // SAFETY: base/len describe the mapping created in `create`. Forked
        // workers leave with `_exit` and never reach this.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

//! Producer-side buffer swap engine.
//!
//! The producer appends fixed-width values into the work buffer and, once per
//! cycle, either hands that buffer to the sender (swap) or, while the
//! previous handoff is still outstanding, leaves the data where it is so it
//! coalesces with the next cycle's writes.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

use crate::channel::FlowControl;
use crate::shared::SharedState;

/// What `end_cycle` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The work buffer was handed to the sender.
    Published { bytes: usize },
    /// A send is still outstanding; `pending` bytes stay in the work buffer.
    Coalesced { pending: usize },
}

/// Producer handle over the shared state and flow-control channels.
///
/// There must be exactly one producer per shared region, so engines are only
/// built inside the crate and never shared between threads.
pub struct SwapEngine<'a> {
    shared: &'a SharedState,
    flow: &'a FlowControl,
    _not_sync: PhantomData<Cell<()>>,
}

impl<'a> SwapEngine<'a> {
    pub(crate) fn new(shared: &'a SharedState, flow: &'a FlowControl) -> Self {
        Self {
            shared,
            flow,
            _not_sync: PhantomData,
        }
    }

    /// Append raw bytes to the work buffer.
    ///
    /// All-or-nothing: the append is accepted only while
    /// `used + len < capacity`. A rejected append is counted in the drop
    /// statistics and leaves the buffer untouched.
    pub fn push_bytes(&self, bytes: &[u8]) -> bool {
        let swap = self.shared.swap();
        let used = swap.work_buffer_used.load(Ordering::Relaxed);

        let fits = used
            .checked_add(bytes.len())
            .is_some_and(|end| end < self.shared.work_capacity());

        if !fits {
            let counters = self.shared.counters();
            counters.appends_dropped.fetch_add(1, Ordering::Relaxed);
            counters
                .bytes_dropped
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            return false;
        }

        // SAFETY: we are the producer and the bounds were checked above.
        unsafe { self.shared.write_work(used, bytes) };
        swap.work_buffer_used
            .store(used + bytes.len(), Ordering::Release);
        true
    }

    pub fn push_i32(&self, value: i32) -> bool {
        self.push_bytes(&value.to_le_bytes())
    }

    pub fn push_u32(&self, value: u32) -> bool {
        self.push_bytes(&value.to_le_bytes())
    }

    pub fn push_f32(&self, value: f32) -> bool {
        self.push_bytes(&value.to_le_bytes())
    }

    /// Finish a producer cycle: reclaim the send buffer if the sender is done
    /// with it, then publish the work buffer if no send is outstanding.
    pub fn end_cycle(&self) -> CycleOutcome {
        let swap = self.shared.swap();

        match self.flow.poll_done() {
            Ok(true) => {
                swap.busy.store(false, Ordering::Release);
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to poll done channel: {}", e);
            }
        }

        if swap.busy.load(Ordering::Acquire) {
            self.shared
                .counters()
                .cycles_coalesced
                .fetch_add(1, Ordering::Relaxed);
            return CycleOutcome::Coalesced {
                pending: swap.work_buffer_used.load(Ordering::Relaxed),
            };
        }

        // The old send buffer becomes the new work buffer
        let bytes = swap.work_buffer_used.load(Ordering::Relaxed);
        let old_work = self.shared.work_index();
        swap.bytes_to_send.store(bytes, Ordering::Release);
        swap.work_index.store(old_work ^ 1, Ordering::Release);
        swap.work_buffer_used.store(0, Ordering::Release);
        swap.busy.store(true, Ordering::Release);

        if let Err(e) = self.flow.signal_ready() {
            // Nobody will ever acknowledge this handoff
            warn!("Failed to signal ready, dropping {} bytes: {}", bytes, e);
            swap.busy.store(false, Ordering::Release);
            return CycleOutcome::Published { bytes };
        }

        self.shared
            .counters()
            .handoffs_published
            .fetch_add(1, Ordering::Relaxed);
        debug!("Published {} bytes from buffer {}", bytes, old_work);

        CycleOutcome::Published { bytes }
    }
}

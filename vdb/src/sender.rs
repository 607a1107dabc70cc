//! Sender worker.
//!
//! Waits for the producer to publish a buffer, frames it, writes header and
//! payload to the viewer, and signals completion:
//!
//! ```text
//! WaitReady -> Frame -> SendHeader -> SendPayload -> SignalDone -> WaitReady
//!                           |              |
//!                           +--(failure)---+--> SignalDone -> exit
//! ```
//!
//! `SignalDone` runs on every path that consumed a ready token. Between the
//! two the handoff is marked in flight in shared memory, so whoever kills a
//! sender mid-send can finish the handoff with
//! [`recover_abandoned_handoff`].

use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channel::FlowControl;
use crate::error::{Result, TransportError};
use crate::net::Network;
use crate::protocol::Protocol;
use crate::shared::SharedState;

/// How long a single wait for a ready token lasts before the stop condition
/// is checked again.
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    WaitReady,
    Frame,
    SendHeader,
    SendPayload,
    SignalDone,
}

/// Why the sender loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderExit {
    /// A flow-control channel broke.
    ChannelClosed,
    /// Writing a frame failed; the connection is assumed dead.
    TransmitFailed,
    /// Termination was requested while idle.
    Terminated,
}

/// Write all of `bytes`, one `send` call at a time.
///
/// A call that reports zero progress or an error aborts the whole write.
pub fn send_all<N: Network + ?Sized>(net: &mut N, bytes: &[u8]) -> Result<()> {
    let mut remaining = bytes;
    while !remaining.is_empty() {
        match net.send(remaining)? {
            0 => return Err(TransportError::ZeroProgress),
            n if n > remaining.len() => {
                return Err(TransportError::Network(std::io::Error::other(
                    "sent more bytes than requested",
                )));
            }
            n => remaining = &remaining[n..],
        }
    }
    Ok(())
}

/// Signal done for a handoff whose sender died before it could.
///
/// Only call this once the sender is known to be gone. Returns whether a
/// token was written.
pub fn recover_abandoned_handoff(shared: &SharedState, flow: &FlowControl) -> bool {
    if !shared.take_in_flight() {
        return false;
    }
    match flow.signal_done() {
        Ok(()) => {
            warn!("Sender died during a send, signaled done on its behalf");
            true
        }
        Err(e) => {
            warn!("Failed to signal done for an abandoned send: {}", e);
            false
        }
    }
}

pub struct SenderWorker<'a, N: Network, P: Protocol> {
    shared: &'a SharedState,
    flow: &'a FlowControl,
    net: &'a mut N,
    protocol: &'a P,
    state: SenderState,
    header: Vec<u8>,
    failure: Option<TransportError>,
    wait_slice: Duration,
}

impl<'a, N: Network, P: Protocol> SenderWorker<'a, N, P> {
    pub fn new(
        shared: &'a SharedState,
        flow: &'a FlowControl,
        net: &'a mut N,
        protocol: &'a P,
    ) -> Self {
        Self {
            shared,
            flow,
            net,
            protocol,
            state: SenderState::WaitReady,
            header: Vec::new(),
            failure: None,
            wait_slice: DEFAULT_WAIT_SLICE,
        }
    }

    pub fn with_wait_slice(mut self, wait_slice: Duration) -> Self {
        self.wait_slice = wait_slice;
        self
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Run until a channel breaks, a transmission fails, or `should_stop`
    /// returns true while no send is outstanding.
    pub fn run(&mut self, should_stop: impl Fn() -> bool) -> SenderExit {
        info!("Sender worker started");

        loop {
            self.state = match self.state {
                SenderState::WaitReady => {
                    if should_stop() {
                        info!("Sender worker terminating");
                        return SenderExit::Terminated;
                    }
                    match self.flow.wait_ready_timeout(self.wait_slice) {
                        Ok(true) => {
                            self.shared.set_in_flight(true);
                            SenderState::Frame
                        }
                        Ok(false) => SenderState::WaitReady,
                        Err(e) => {
                            warn!("Sender lost the ready channel: {}", e);
                            return SenderExit::ChannelClosed;
                        }
                    }
                }
                SenderState::Frame => {
                    self.header = self.protocol.form_frame(self.shared.bytes_to_send());
                    SenderState::SendHeader
                }
                SenderState::SendHeader => match send_all(&mut *self.net, &self.header) {
                    Ok(()) => SenderState::SendPayload,
                    Err(e) => {
                        warn!("Failed to send frame header: {}", e);
                        self.failure = Some(e);
                        SenderState::SignalDone
                    }
                },
                SenderState::SendPayload => {
                    // SAFETY: we hold the handoff until SignalDone.
                    let payload = unsafe { self.shared.send_payload() };
                    match send_all(&mut *self.net, payload) {
                        Ok(()) => {
                            let counters = self.shared.counters();
                            counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                            counters
                                .bytes_sent
                                .fetch_add(payload.len() as u64, Ordering::Relaxed);
                            debug!("Sent frame with {} payload bytes", payload.len());
                        }
                        Err(e) => {
                            warn!("Failed to send payload: {}", e);
                            self.failure = Some(e);
                        }
                    }
                    SenderState::SignalDone
                }
                SenderState::SignalDone => {
                    let signaled = self.flow.signal_done();
                    self.shared.set_in_flight(false);

                    if let Some(e) = self.failure.take() {
                        self.shared
                            .counters()
                            .send_failures
                            .fetch_add(1, Ordering::Relaxed);
                        info!("Sender worker exiting after failed send: {}", e);
                        return SenderExit::TransmitFailed;
                    }
                    if let Err(e) = signaled {
                        warn!("Sender lost the done channel: {}", e);
                        return SenderExit::ChannelClosed;
                    }
                    SenderState::WaitReady
                }
            };
        }
    }
}

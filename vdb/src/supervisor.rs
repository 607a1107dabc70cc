//! Connection supervisor worker.
//!
//! Owns the viewer connection: listens, accepts a single client, performs
//! the handshake, keeps a sender worker running while connected, and watches
//! the inbound side for disconnects and control commands.
//!
//! ```text
//! NoSocket -> Listening -> Accepted -> Handshaking -> Connected
//!                ^                                       |
//!                +------------- disconnect --------------+
//!
//! Connected --(shutdown command)--> Closed
//! ```

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::channel::{AckChannel, FlowControl};
use crate::config::TransportConfig;
use crate::error::Result;
use crate::net::{Network, is_timeout};
use crate::process::{
    WorkerHandle, WorkerLauncher, WorkerRole, install_termination_handler, termination_requested,
};
use crate::protocol::{ControlCommand, Protocol};
use crate::sender::{DEFAULT_WAIT_SLICE, SenderWorker, recover_abandoned_handoff, send_all};
use crate::shared::SharedState;

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NoSocket,
    Listening,
    Accepted,
    Handshaking,
    Connected,
    Closed,
}

/// Result of making sure a sender is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderStart {
    Running,
    LaunchFailed,
    /// The slot is claimed but this supervisor tracks no sender.
    SlotTaken,
}

/// Resolved settings for one supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub port: u16,
    pub backoff: Duration,
    pub terminate_grace: Duration,
    pub sender_wait_slice: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        Ok(Self {
            port: config.validate()?,
            backoff: config.backoff,
            terminate_grace: config.terminate_grace,
            sender_wait_slice: DEFAULT_WAIT_SLICE,
        })
    }
}

pub struct Supervisor<'a, N: Network, P: Protocol, L: WorkerLauncher> {
    shared: &'a SharedState,
    flow: &'a FlowControl,
    net: N,
    protocol: P,
    launcher: L,
    settings: SupervisorSettings,
    state: SupervisorState,
    sender: Option<WorkerHandle>,
    request_len: usize,
}

impl<'a, N: Network, P: Protocol, L: WorkerLauncher> Supervisor<'a, N, P, L> {
    pub fn new(
        shared: &'a SharedState,
        flow: &'a FlowControl,
        net: N,
        protocol: P,
        launcher: L,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            shared,
            flow,
            net,
            protocol,
            launcher,
            settings,
            state: SupervisorState::NoSocket,
            sender: None,
            request_len: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn network(&self) -> &N {
        &self.net
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.net
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn launcher_mut(&mut self) -> &mut L {
        &mut self.launcher
    }

    pub fn sender(&self) -> Option<WorkerHandle> {
        self.sender
    }

    /// Run until the session is closed.
    pub fn run(&mut self) {
        info!("Connection supervisor started");
        while self.step() != SupervisorState::Closed {}
        info!("Connection supervisor stopped");
    }

    /// Attempt one state transition and return the resulting state.
    pub fn step(&mut self) -> SupervisorState {
        self.state = match self.state {
            SupervisorState::NoSocket => self.listen(),
            SupervisorState::Listening => self.accept(),
            SupervisorState::Accepted => self.read_request(),
            SupervisorState::Handshaking => self.handshake(),
            SupervisorState::Connected => self.serve(),
            SupervisorState::Closed => SupervisorState::Closed,
        };
        self.state
    }

    fn backoff(&self) {
        if !self.settings.backoff.is_zero() {
            thread::sleep(self.settings.backoff);
        }
    }

    fn listen(&mut self) -> SupervisorState {
        match self.net.listen(self.settings.port) {
            Ok(()) => SupervisorState::Listening,
            Err(e) => {
                warn!(
                    "Failed to listen on port {}: {}, retrying in {:?}",
                    self.settings.port, e, self.settings.backoff
                );
                self.backoff();
                SupervisorState::NoSocket
            }
        }
    }

    fn accept(&mut self) -> SupervisorState {
        match self.net.accept() {
            Ok(()) => SupervisorState::Accepted,
            Err(e) => {
                warn!("Accept failed: {}, retrying in {:?}", e, self.settings.backoff);
                self.backoff();
                SupervisorState::Listening
            }
        }
    }

    /// Read the client's upgrade request into the receive buffer.
    fn read_request(&mut self) -> SupervisorState {
        let shared = self.shared;
        // SAFETY: only the supervisor uses the receive buffer.
        let buf = unsafe { shared.recv_buffer() };
        let mut len = 0;

        while !buf[..len].windows(HEADER_END.len()).any(|w| w == HEADER_END) {
            if len == buf.len() {
                warn!("Handshake request exceeds {} bytes", buf.len());
                return self.abandon_handshake();
            }
            match self.net.receive(&mut buf[len..]) {
                Ok(0) => {
                    warn!("Viewer closed the connection during the handshake");
                    return self.abandon_handshake();
                }
                Ok(n) => len += n,
                Err(e) => {
                    warn!("Failed to read handshake request: {}", e);
                    return self.abandon_handshake();
                }
            }
        }

        debug!("Received {} byte handshake request", len);
        self.request_len = len;
        SupervisorState::Handshaking
    }

    fn handshake(&mut self) -> SupervisorState {
        let shared = self.shared;
        // SAFETY: only the supervisor uses the receive buffer.
        let request = unsafe { &shared.recv_buffer()[..self.request_len] };

        let response = match self.protocol.generate_handshake(request) {
            Ok(response) => response,
            Err(e) => {
                warn!("Rejecting handshake: {}", e);
                return self.abandon_handshake();
            }
        };

        if let Err(e) = send_all(&mut self.net, &response) {
            warn!("Failed to send handshake response: {}", e);
            return self.abandon_handshake();
        }

        self.shared.set_connection(true);
        self.shared
            .counters()
            .connections
            .fetch_add(1, Ordering::Relaxed);
        info!("Viewer connected");

        match self.ensure_sender() {
            SenderStart::SlotTaken => self.disconnect("send worker slot is held elsewhere"),
            SenderStart::Running | SenderStart::LaunchFailed => SupervisorState::Connected,
        }
    }

    fn abandon_handshake(&mut self) -> SupervisorState {
        self.net.shutdown();
        self.backoff();
        SupervisorState::Listening
    }

    fn serve(&mut self) -> SupervisorState {
        if let Some(handle) = self.sender {
            if !self.launcher.is_alive(handle) {
                // A failed send may have left a partial frame on the wire
                self.sender = None;
                self.reclaim_send_slot();
                return self.disconnect("sender worker exited");
            }
        }

        match self.ensure_sender() {
            SenderStart::Running => {}
            SenderStart::LaunchFailed => self.backoff(),
            SenderStart::SlotTaken => {
                return self.disconnect("send worker slot is held elsewhere");
            }
        }

        let shared = self.shared;
        // SAFETY: only the supervisor uses the receive buffer.
        let buf = unsafe { shared.recv_buffer() };
        match self.net.receive(buf) {
            Ok(0) => self.disconnect("viewer closed the connection"),
            Ok(n) => self.handle_inbound(n),
            Err(e) if is_timeout(&e) => SupervisorState::Connected,
            Err(e) => {
                let reason = format!("receive failed: {}", e);
                self.disconnect(&reason)
            }
        }
    }

    fn handle_inbound(&mut self, len: usize) -> SupervisorState {
        let shared = self.shared;
        // SAFETY: only the supervisor uses the receive buffer.
        let raw = unsafe { &shared.recv_buffer()[..len] };

        let Some(msg) = self.protocol.parse_message(raw) else {
            debug!("Ignoring {} inbound bytes that are not a complete message", len);
            return SupervisorState::Connected;
        };

        if !msg.fin {
            info!(
                "Ignoring incomplete message ({} payload bytes)",
                msg.payload.len()
            );
            return SupervisorState::Connected;
        }

        match ControlCommand::from_message(&msg) {
            Some(ControlCommand::Shutdown) => {
                info!("Shutdown requested by viewer, closing session");
                self.shared.close_session();
                self.teardown();
                SupervisorState::Closed
            }
            Some(ControlCommand::Close) => self.disconnect("viewer sent close frame"),
            None => {
                debug!("Ignoring message with opcode {:#x}", msg.opcode);
                SupervisorState::Connected
            }
        }
    }

    fn disconnect(&mut self, reason: &str) -> SupervisorState {
        info!("Viewer disconnected: {}", reason);
        self.shared
            .counters()
            .disconnects
            .fetch_add(1, Ordering::Relaxed);
        self.teardown();
        self.backoff();
        SupervisorState::Listening
    }

    fn teardown(&mut self) {
        self.shared.set_connection(false);
        // Shut the socket first so a sender stuck in a write fails out
        self.net.shutdown();

        if let Some(handle) = self.sender.take() {
            self.launcher
                .terminate(handle, self.settings.terminate_grace);
            self.reclaim_send_slot();
        }
    }

    /// Free the send slot of a sender that is known to be gone.
    fn reclaim_send_slot(&mut self) {
        recover_abandoned_handoff(self.shared, self.flow);
        self.shared.set_send_worker_pid(0);
        self.shared.release_send_worker();
    }

    fn ensure_sender(&mut self) -> SenderStart {
        if self.sender.is_some() {
            return SenderStart::Running;
        }
        if !self.shared.claim_send_worker() {
            error!("Send worker slot is claimed but no sender is tracked");
            return SenderStart::SlotTaken;
        }

        let shared = self.shared;
        let flow = self.flow;
        let net = &mut self.net;
        let protocol = &self.protocol;
        let wait_slice = self.settings.sender_wait_slice;

        let mut body = |ack: &mut AckChannel| {
            if let Err(e) = install_termination_handler() {
                error!("Sender could not install its SIGTERM handler: {}", e);
                return;
            }
            if let Err(e) = ack.acknowledge() {
                error!("Sender could not acknowledge startup: {}", e);
                return;
            }
            let exit = SenderWorker::new(shared, flow, &mut *net, protocol)
                .with_wait_slice(wait_slice)
                .run(termination_requested);
            info!("Sender worker exiting: {:?}", exit);
            // Done is already signaled; an orphaned sender frees its own slot
            shared.release_send_worker();
        };

        match self.launcher.launch(WorkerRole::Sender, &mut body) {
            Ok(handle) => {
                self.shared.set_send_worker_pid(handle.pid);
                self.sender = Some(handle);
                SenderStart::Running
            }
            Err(e) => {
                warn!("Failed to start sender worker: {}", e);
                self.shared.release_send_worker();
                SenderStart::LaunchFailed
            }
        }
    }
}

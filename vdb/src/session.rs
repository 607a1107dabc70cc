//! Session bootstrap.
//!
//! A [`Session`] owns the shared region and the flow-control channels, and
//! keeps a connection supervisor running. [`Session::begin`] is meant to be
//! called once per producer cycle.

use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::channel::{AckChannel, FlowControl};
use crate::config::TransportConfig;
use crate::error::Result;
use crate::net::TcpNetwork;
use crate::process::{ForkLauncher, WorkerHandle, WorkerLauncher, WorkerRole};
use crate::protocol::WebSocket;
use crate::sender::recover_abandoned_handoff;
use crate::shared::{SharedState, TransportStats};
use crate::supervisor::{Supervisor, SupervisorSettings};
use crate::swap::{CycleOutcome, SwapEngine};

/// Producer side of the transport.
///
/// Producing needs `&mut self`: there is one producer per shared region.
///
/// ```compile_fail
/// fn produce_through_shared_ref(session: &vdb::Session) {
///     session.push_i32(1);
/// }
/// ```
pub struct Session<L: WorkerLauncher = ForkLauncher> {
    shared: SharedState,
    flow: FlowControl,
    config: TransportConfig,
    settings: SupervisorSettings,
    launcher: L,
    supervisor: Option<WorkerHandle>,
}

impl Session<ForkLauncher> {
    /// Validate `config` and create the shared state and channels.
    pub fn create(config: TransportConfig) -> Result<Self> {
        let launcher = ForkLauncher::new(config.spawn_ack_timeout);
        Self::with_launcher(config, launcher)
    }
}

impl<L: WorkerLauncher> Session<L> {
    pub fn with_launcher(config: TransportConfig, launcher: L) -> Result<Self> {
        let settings = SupervisorSettings::from_config(&config)?;
        let shared = SharedState::create(config.work_buffer_size, config.recv_buffer_size)?;
        let flow = FlowControl::new()?;

        info!(
            "Created vdb session: port {}, {} byte buffers, {} byte shared region",
            settings.port,
            config.work_buffer_size,
            shared.len()
        );

        Ok(Self {
            shared,
            flow,
            config,
            settings,
            launcher,
            supervisor: None,
        })
    }

    /// Make sure the connection supervisor is running and report whether a
    /// viewer is connected.
    ///
    /// Returns `Ok(false)` for good once a viewer has closed the session.
    pub fn begin(&mut self) -> Result<bool> {
        self.reap_supervisor();

        if self.shared.is_session_closed() {
            return Ok(false);
        }

        if self.supervisor.is_none() {
            self.spawn_supervisor()?;
        }

        Ok(self.shared.has_connection())
    }

    fn reap_supervisor(&mut self) {
        let Some(handle) = self.supervisor else {
            return;
        };
        if self.launcher.is_alive(handle) {
            return;
        }

        if !self.shared.is_session_closed() {
            warn!("Connection supervisor (pid {}) exited unexpectedly", handle.pid);
        }
        self.supervisor = None;
        self.shared.set_connection(false);
        self.reclaim_orphaned_sender();
        self.shared.release_recv_worker();
    }

    /// Free the send slot held by the dead supervisor's sender.
    ///
    /// That sender got SIGTERM when its supervisor died and normally frees
    /// the slot itself. If it has not within the grace period it is killed
    /// and the slot is freed here.
    fn reclaim_orphaned_sender(&mut self) {
        if !self.shared.has_send_worker() {
            recover_abandoned_handoff(&self.shared, &self.flow);
            return;
        }

        let pid = self.shared.send_worker_pid();
        let deadline = Instant::now() + self.config.terminate_grace;
        while self.shared.has_send_worker() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        if self.shared.has_send_worker() {
            warn!("Orphaned sender (pid {}) did not exit", pid);
            self.launcher.kill_orphan(pid);
        }
        recover_abandoned_handoff(&self.shared, &self.flow);
        self.shared.set_send_worker_pid(0);
        self.shared.release_send_worker();
    }

    fn spawn_supervisor(&mut self) -> Result<()> {
        if !self.shared.claim_recv_worker() {
            return Ok(());
        }

        let shared = &self.shared;
        let flow = &self.flow;
        let config = &self.config;
        let settings = &self.settings;

        let mut body = |ack: &mut AckChannel| {
            let net = TcpNetwork::new(config.send_timeout, config.recv_poll_interval);
            let launcher = ForkLauncher::new(config.spawn_ack_timeout);
            let mut supervisor =
                Supervisor::new(shared, flow, net, WebSocket, launcher, settings.clone());

            if let Err(e) = ack.acknowledge() {
                error!("Supervisor could not acknowledge startup: {}", e);
                return;
            }
            supervisor.run();
        };

        match self.launcher.launch(WorkerRole::Supervisor, &mut body) {
            Ok(handle) => {
                self.supervisor = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.release_recv_worker();
                Err(e)
            }
        }
    }

    /// Stop the connection supervisor, if one is running.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            self.launcher.terminate(handle, self.config.terminate_grace);
            self.shared.set_connection(false);
            self.reclaim_orphaned_sender();
            self.shared.release_recv_worker();
        }
    }

    fn engine(&mut self) -> SwapEngine<'_> {
        SwapEngine::new(&self.shared, &self.flow)
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> bool {
        self.engine().push_bytes(bytes)
    }

    pub fn push_i32(&mut self, value: i32) -> bool {
        self.engine().push_i32(value)
    }

    pub fn push_u32(&mut self, value: u32) -> bool {
        self.engine().push_u32(value)
    }

    pub fn push_f32(&mut self, value: f32) -> bool {
        self.engine().push_f32(value)
    }

    pub fn end_cycle(&mut self) -> CycleOutcome {
        self.engine().end_cycle()
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.stats()
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub fn supervisor(&self) -> Option<WorkerHandle> {
        self.supervisor
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn launcher_mut(&mut self) -> &mut L {
        &mut self.launcher
    }
}

impl<L: WorkerLauncher> Drop for Session<L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        FrameHeader, client_handshake, encode_client_frame, opcode, verify_handshake_response,
    };
    use crate::testing::FakeLauncher;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn fake_session() -> Session<FakeLauncher> {
        let config = TransportConfig::default()
            .with_listen_port(9001)
            .with_work_buffer_size(256)
            .with_recv_buffer_size(256)
            .with_terminate_grace(Duration::from_millis(20));
        Session::with_launcher(config, FakeLauncher::default()).unwrap()
    }

    #[test]
    fn test_begin_spawns_supervisor_once() {
        let mut session = fake_session();

        assert!(!session.begin().unwrap());
        assert!(!session.begin().unwrap());
        assert!(session.shared().has_recv_worker());
        assert_eq!(session.launcher().launched_roles(WorkerRole::Supervisor), 1);

        session.shared().set_connection(true);
        assert!(session.begin().unwrap());
        assert_eq!(session.launcher().launched.len(), 1);
    }

    #[test]
    fn test_dead_supervisor_is_replaced() {
        let mut session = fake_session();
        session.begin().unwrap();
        let first = session.supervisor().unwrap();
        session.shared().set_connection(true);

        session.launcher_mut().kill(first);
        assert!(!session.begin().unwrap());

        let second = session.supervisor().unwrap();
        assert_ne!(first, second);
        assert!(session.shared().has_recv_worker());
        assert_eq!(session.launcher().launched.len(), 2);
    }

    #[test]
    fn test_dead_supervisor_frees_stuck_send_slot() {
        let mut session = fake_session();
        session.begin().unwrap();
        let supervisor = session.supervisor().unwrap();

        // Its sender holds the slot and a handoff, and never exits
        assert!(session.shared().claim_send_worker());
        session.shared().set_send_worker_pid(4242);
        session.shared().set_in_flight(true);

        session.launcher_mut().kill(supervisor);
        assert!(!session.begin().unwrap());

        assert!(!session.shared().has_send_worker());
        assert_eq!(session.shared().send_worker_pid(), 0);
        assert_eq!(session.launcher().orphans_killed, vec![4242]);
        assert!(session.flow().poll_done().unwrap());
        assert_eq!(session.launcher().launched_roles(WorkerRole::Supervisor), 2);

        // The replacement supervisor can claim the slot again
        assert!(session.shared().claim_send_worker());
    }

    #[test]
    fn test_orphaned_sender_that_exits_is_not_killed() {
        let mut session = fake_session();
        session.begin().unwrap();
        let supervisor = session.supervisor().unwrap();
        session.shared().set_send_worker_pid(4242);

        session.launcher_mut().kill(supervisor);
        session.begin().unwrap();

        assert!(session.launcher().orphans_killed.is_empty());
        assert!(!session.shared().has_send_worker());
    }

    #[test]
    fn test_closed_session_stays_closed() {
        let mut session = fake_session();
        session.begin().unwrap();
        let supervisor = session.supervisor().unwrap();

        session.shared().close_session();
        session.launcher_mut().kill(supervisor);

        for _ in 0..3 {
            assert!(!session.begin().unwrap());
        }
        assert!(session.supervisor().is_none());
        assert_eq!(session.launcher().launched.len(), 1);
    }

    #[test]
    fn test_failed_launch_releases_claim() {
        let mut session = fake_session();
        session.launcher_mut().failing_launches = 1;

        assert!(session.begin().is_err());
        assert!(!session.shared().has_recv_worker());

        assert!(!session.begin().unwrap());
        assert!(session.shared().has_recv_worker());
    }

    #[test]
    fn test_shutdown_terminates_supervisor() {
        let mut session = fake_session();
        session.begin().unwrap();
        let supervisor = session.supervisor().unwrap();

        session.shutdown();
        assert_eq!(session.launcher().terminated, vec![supervisor]);
        assert!(!session.shared().has_recv_worker());
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let config = TransportConfig::default().with_listen_port(70000);
        assert!(Session::with_launcher(config, FakeLauncher::default()).is_err());
    }

    #[test]
    fn test_producer_calls_go_to_the_work_buffer() {
        let mut session = fake_session();
        assert!(session.push_i32(4));
        assert!(session.push_f32(0.25));
        assert!(session.push_u32(9));
        assert_eq!(session.end_cycle(), CycleOutcome::Published { bytes: 12 });
        assert_eq!(session.stats().handoffs_published, 1);
    }

    #[test]
    fn test_producers_on_many_threads_lose_no_bytes() {
        let config = TransportConfig::default()
            .with_listen_port(9001)
            .with_work_buffer_size(1 << 20);
        let session = Session::with_launcher(config, FakeLauncher::default()).unwrap();
        let session = parking_lot::Mutex::new(session);

        thread::scope(|s| {
            for t in 0..4 {
                let session = &session;
                s.spawn(move || {
                    for i in 0..5000 {
                        assert!(session.lock().push_i32(t * 10_000 + i));
                    }
                });
            }
        });

        let session = session.into_inner();
        assert_eq!(session.shared().work_buffer_used(), 4 * 5000 * 4);
        let mut values: Vec<i32> = session
            .shared()
            .work_buffer_snapshot()
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 20_000);
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn connect_with_retry(port: u16) -> TcpStream {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => return stream,
                Err(e) => {
                    assert!(Instant::now() < deadline, "supervisor never listened: {}", e);
                    thread::sleep(Duration::from_millis(20));
                }
            }
        }
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = vec![0u8; 2];
        stream.read_exact(&mut header).unwrap();
        let extra = match header[1] & 0x7F {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        header.resize(2 + extra, 0);
        stream.read_exact(&mut header[2..]).unwrap();

        let decoded = FrameHeader::decode(&header).unwrap();
        assert!(decoded.fin);
        assert_eq!(decoded.opcode, opcode::BINARY);
        assert!(decoded.mask.is_none());

        let mut payload = vec![0u8; decoded.payload_len as usize];
        stream.read_exact(&mut payload).unwrap();
        payload
    }

    #[test]
    fn test_forked_workers_stream_to_a_viewer() {
        let port = free_port();
        let config = TransportConfig::default()
            .with_listen_port(port as u32)
            .with_work_buffer_size(4096)
            .with_recv_buffer_size(4096)
            .with_backoff(Duration::from_millis(20))
            .with_recv_poll_interval(Duration::from_millis(50));
        let mut session = Session::create(config).unwrap();

        assert!(!session.begin().unwrap());
        let mut stream = connect_with_retry(port);
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        stream
            .write_all(client_handshake("localhost", key).as_bytes())
            .unwrap();

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            response.push(byte[0]);
        }
        verify_handshake_response(&response, key).unwrap();

        wait_until("connection", || session.begin().unwrap());

        for v in [1, 2, 3] {
            assert!(session.push_i32(v));
        }
        assert_eq!(session.end_cycle(), CycleOutcome::Published { bytes: 12 });

        let payload = read_frame(&mut stream);
        assert_eq!(payload.len(), 12);
        assert_eq!(payload[..4], 1i32.to_le_bytes());
        assert_eq!(payload[8..], 3i32.to_le_bytes());

        // Done comes back through the pipe, freeing the next handoff
        wait_until("done", || {
            session.push_i32(4);
            matches!(session.end_cycle(), CycleOutcome::Published { .. })
        });
        let payload = read_frame(&mut stream);
        assert!(!payload.is_empty());
        assert!(payload.chunks_exact(4).all(|c| c == 4i32.to_le_bytes()));

        let shutdown = encode_client_frame(opcode::TEXT, b"shutdown", [3, 1, 4, 1]);
        stream.write_all(&shutdown).unwrap();

        wait_until("session close", || session.shared().is_session_closed());
        wait_until("supervisor exit", || {
            session.begin().unwrap();
            session.supervisor().is_none()
        });
        assert!(!session.begin().unwrap());
        assert!(!session.shared().has_connection());
        assert_eq!(session.stats().frames_sent, 2);
    }
}

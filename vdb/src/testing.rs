//! Scripted test doubles for the network and the worker launcher.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::time::Duration;

use crate::error::{Result, TransportError};
use crate::net::Network;
use crate::process::{WorkerBody, WorkerHandle, WorkerLauncher, WorkerRole};

/// In-memory [`Network`] driven by queued results.
///
/// Empty queues mean success for `listen`/`accept` and "nothing arrived
/// yet" (`WouldBlock`) for `receive`.
#[derive(Default)]
pub struct FakeNetwork {
    pub listen_results: VecDeque<io::Result<()>>,
    pub accept_results: VecDeque<io::Result<()>>,
    pub inbound: VecDeque<io::Result<Vec<u8>>>,
    pub sent: Vec<u8>,
    pub send_calls: usize,
    /// Largest number of bytes a single `send` accepts.
    pub send_limit: Option<usize>,
    /// Every `send` after this many calls fails.
    pub fail_sends_after: Option<usize>,
    pub zero_progress: bool,
    pub listened_on: Vec<u16>,
    pub accepts: usize,
    pub shutdowns: usize,
    listening: bool,
    client: bool,
}

impl FakeNetwork {
    /// A network with an already accepted client.
    pub fn connected() -> Self {
        Self {
            listening: true,
            client: true,
            ..Self::default()
        }
    }

    pub fn push_inbound(&mut self, bytes: &[u8]) {
        self.inbound.push_back(Ok(bytes.to_vec()));
    }

    pub fn push_receive_error(&mut self, kind: io::ErrorKind) {
        self.inbound.push_back(Err(io::Error::from(kind)));
    }
}

impl Network for FakeNetwork {
    fn listen(&mut self, port: u16) -> io::Result<()> {
        self.listen_results.pop_front().unwrap_or(Ok(()))?;
        self.listening = true;
        self.listened_on.push(port);
        Ok(())
    }

    fn accept(&mut self) -> io::Result<()> {
        if !self.listening {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        self.accept_results.pop_front().unwrap_or(Ok(()))?;
        self.client = true;
        self.accepts += 1;
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if !self.client {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let calls = self.send_calls;
        self.send_calls += 1;
        if self.fail_sends_after.is_some_and(|limit| calls >= limit) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if self.zero_progress {
            return Ok(0);
        }

        let n = self.send_limit.map_or(bytes.len(), |l| l.min(bytes.len()));
        self.sent.extend_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.client {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        match self.inbound.pop_front() {
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Some(Err(e)) => Err(e),
            Some(Ok(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.inbound.push_front(Ok(data[n..].to_vec()));
                }
                Ok(n)
            }
        }
    }

    fn shutdown(&mut self) {
        self.shutdowns += 1;
        self.client = false;
    }

    fn has_listener(&self) -> bool {
        self.listening
    }

    fn has_client(&self) -> bool {
        self.client
    }
}

/// [`WorkerLauncher`] that records launches instead of forking.
///
/// Worker bodies are never run; tests mark workers dead through `dead`.
pub struct FakeLauncher {
    pub launched: Vec<WorkerHandle>,
    pub terminated: Vec<WorkerHandle>,
    pub dead: HashSet<i32>,
    pub orphans_killed: Vec<i32>,
    /// Number of upcoming launches that fail with a missing acknowledgment.
    pub failing_launches: usize,
    next_pid: i32,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            launched: Vec::new(),
            terminated: Vec::new(),
            dead: HashSet::new(),
            orphans_killed: Vec::new(),
            failing_launches: 0,
            next_pid: 1000,
        }
    }
}

impl FakeLauncher {
    pub fn launched_roles(&self, role: WorkerRole) -> usize {
        self.launched.iter().filter(|h| h.role == role).count()
    }

    pub fn kill(&mut self, handle: WorkerHandle) {
        self.dead.insert(handle.pid);
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&mut self, role: WorkerRole, _body: &mut WorkerBody<'_>) -> Result<WorkerHandle> {
        if self.failing_launches > 0 {
            self.failing_launches -= 1;
            return Err(TransportError::NoAck { role: role.name() });
        }
        let handle = WorkerHandle {
            role,
            pid: self.next_pid,
        };
        self.next_pid += 1;
        self.launched.push(handle);
        Ok(handle)
    }

    fn terminate(&mut self, handle: WorkerHandle, _grace: Duration) {
        self.terminated.push(handle);
        self.dead.insert(handle.pid);
    }

    fn is_alive(&mut self, handle: WorkerHandle) -> bool {
        !self.dead.contains(&handle.pid)
    }

    fn kill_orphan(&mut self, pid: i32) {
        self.orphans_killed.push(pid);
        self.dead.insert(pid);
    }
}

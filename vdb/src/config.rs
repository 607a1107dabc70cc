//! Transport configuration and the listen-port setting.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, TransportError};

/// Port used when none has been configured.
pub const DEFAULT_LISTEN_PORT: u16 = 8000;

pub const MIN_LISTEN_PORT: u16 = 1024;
pub const MAX_LISTEN_PORT: u16 = 65535;

/// Default capacity of each of the two work/send buffers.
pub const DEFAULT_WORK_BUFFER_SIZE: usize = 1024 * 1024;

/// Default capacity of the supervisor's receive buffer.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 1024 * 1024;

/// Port baked in at compile time with `VDB_LISTEN_PORT=<port> cargo build`.
const COMPILED_LISTEN_PORT: Option<&str> = option_env!("VDB_LISTEN_PORT");

// 0 = unset. Holds a u32 so out-of-range values survive until validation.
static LISTEN_PORT: AtomicU32 = AtomicU32::new(0);

/// Set the port the supervisor listens on.
///
/// Must be called before the first `begin_session()`. Setting the port at
/// runtime while a compile-time port is also present is allowed but warned
/// about, since one of the two is probably a mistake.
pub fn set_listen_port(port: u32) {
    if COMPILED_LISTEN_PORT.is_some() {
        warn!(
            "You are setting the port with set_listen_port and VDB_LISTEN_PORT. Are you sure this is intentional?"
        );
    }
    LISTEN_PORT.store(port, Ordering::Relaxed);
}

/// The configured listen port, 0 if nothing was configured.
pub fn listen_port() -> u32 {
    match LISTEN_PORT.load(Ordering::Relaxed) {
        0 => COMPILED_LISTEN_PORT
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(0),
        port => port,
    }
}

/// Resolve a raw port setting.
///
/// 0 means "unset" and falls back to [`DEFAULT_LISTEN_PORT`] with a warning.
/// Anything outside 1024-65535 is rejected.
pub fn resolve_port(port: u32) -> Result<u16> {
    if port == 0 {
        warn!(
            "You have not set the listening port for vdb. Using {}. \
             Use set_listen_port(<port>) or build with VDB_LISTEN_PORT=<port>. \
             Valid ports are between {} and {}.",
            DEFAULT_LISTEN_PORT, MIN_LISTEN_PORT, MAX_LISTEN_PORT
        );
        return Ok(DEFAULT_LISTEN_PORT);
    }

    if port < MIN_LISTEN_PORT as u32 || port > MAX_LISTEN_PORT as u32 {
        return Err(TransportError::Config(format!(
            "listen port {} is outside the valid range {}-{}",
            port, MIN_LISTEN_PORT, MAX_LISTEN_PORT
        )));
    }

    Ok(port as u16)
}

/// Configuration for a transport session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Raw listen port; 0 means "use the default".
    pub listen_port: u32,
    /// Capacity of each work/send buffer in bytes.
    pub work_buffer_size: usize,
    /// Capacity of the supervisor's receive buffer in bytes.
    pub recv_buffer_size: usize,
    /// Delay before retrying after a listen/accept/handshake failure.
    pub backoff: Duration,
    /// How long a spawner waits for a new worker to acknowledge startup.
    pub spawn_ack_timeout: Duration,
    /// Write timeout on the viewer connection.
    pub send_timeout: Duration,
    /// Read timeout on the viewer connection; bounds how long the supervisor
    /// goes without checking on the sender.
    pub recv_poll_interval: Duration,
    /// How long a terminated sender gets to exit before it is killed.
    pub terminate_grace: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_port: listen_port(),
            work_buffer_size: DEFAULT_WORK_BUFFER_SIZE,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            backoff: Duration::from_secs(1),
            spawn_ack_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(5),
            recv_poll_interval: Duration::from_secs(1),
            terminate_grace: Duration::from_millis(500),
        }
    }
}

impl TransportConfig {
    pub fn with_listen_port(mut self, port: u32) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_work_buffer_size(mut self, size: usize) -> Self {
        self.work_buffer_size = size;
        self
    }

    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_spawn_ack_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_ack_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_recv_poll_interval(mut self, interval: Duration) -> Self {
        self.recv_poll_interval = interval;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Check the configuration and return the resolved listen port.
    pub fn validate(&self) -> Result<u16> {
        if self.work_buffer_size == 0 || self.recv_buffer_size == 0 {
            return Err(TransportError::Config(
                "buffer sizes must be non-zero".to_string(),
            ));
        }
        resolve_port(self.listen_port)
    }
}

//! Low-overhead transport for streaming debug and visualization data from a
//! running program to a remote viewer.
//!
//! The producer appends values into a shared work buffer and calls
//! [`end_cycle`] once per cycle. Network I/O never happens on the producer's
//! path: a forked connection supervisor owns the viewer connection and a
//! forked sender transmits each published buffer as one WebSocket frame.
//!
//! ```no_run
//! vdb::set_listen_port(9001);
//! loop {
//!     if vdb::begin_session() {
//!         vdb::append_i32(1);
//!         vdb::append_f32(0.5);
//!     }
//!     vdb::end_cycle();
//!     vdb::sleep(16);
//! }
//! ```
//!
//! Instrumentation failures never reach the caller: if the transport cannot
//! be set up, every call quietly becomes a no-op.

use parking_lot::Mutex;
use std::time::Duration;
use tracing::error;

pub mod channel;
pub mod config;
pub mod error;
pub mod net;
pub mod process;
pub mod protocol;
pub mod sender;
pub mod session;
pub mod shared;
pub mod supervisor;
pub mod swap;

#[cfg(test)]
mod testing;

pub use config::{TransportConfig, set_listen_port};
pub use error::{ProtocolError, Result, TransportError};
pub use session::Session;
pub use shared::TransportStats;
pub use swap::CycleOutcome;

enum GlobalSession {
    Uninit,
    Active(Box<Session>),
    Disabled,
}

static GLOBAL: Mutex<GlobalSession> = Mutex::new(GlobalSession::Uninit);

/// Start (or keep alive) the process-wide session and report whether a
/// viewer is connected. Call once per cycle before producing data.
pub fn begin_session() -> bool {
    let mut global = GLOBAL.lock();

    if let GlobalSession::Uninit = *global {
        *global = match Session::create(TransportConfig::default()) {
            Ok(session) => GlobalSession::Active(Box::new(session)),
            Err(e) => {
                error!("vdb disabled, setup failed: {}", e);
                GlobalSession::Disabled
            }
        };
    }

    let result = match &mut *global {
        GlobalSession::Active(session) => session.begin(),
        _ => return false,
    };

    match result {
        Ok(connected) => connected,
        Err(e) => {
            error!("vdb disabled, could not start the connection supervisor: {}", e);
            *global = GlobalSession::Disabled;
            false
        }
    }
}

fn with_session<T>(default: T, f: impl FnOnce(&mut Session) -> T) -> T {
    match &mut *GLOBAL.lock() {
        GlobalSession::Active(session) => f(session),
        _ => default,
    }
}

/// Append a little-endian `i32`. Returns false if it did not fit or no
/// session is active.
pub fn append_i32(value: i32) -> bool {
    with_session(false, |s| s.push_i32(value))
}

/// Append a little-endian `f32`. Returns false if it did not fit or no
/// session is active.
pub fn append_f32(value: f32) -> bool {
    with_session(false, |s| s.push_f32(value))
}

/// Append raw bytes, all or nothing. Returns false if they did not fit or
/// no session is active.
///
/// Use this for records that must not be split, such as a count followed by
/// that many values.
pub fn append_bytes(bytes: &[u8]) -> bool {
    with_session(false, |s| s.push_bytes(bytes))
}

/// Publish this cycle's data, or keep accumulating it while the previous
/// frame is still being sent.
pub fn end_cycle() {
    with_session((), |s| {
        s.end_cycle();
    })
}

/// Sleep for `milliseconds`.
pub fn sleep(milliseconds: u64) {
    std::thread::sleep(Duration::from_millis(milliseconds));
}

/// Counters of the process-wide session, if one is active.
pub fn stats() -> Option<TransportStats> {
    with_session(None, |s| Some(s.stats()))
}

//! Flow-control channels between the producer and the sender.
//!
//! Two pipes carry fixed-size tokens:
//!
//! - `ready`: producer -> sender, "a buffer was swapped and awaits
//!   transmission". The sender blocks on it.
//! - `done`: sender -> producer, "the transmission attempt finished". The
//!   producer polls it without blocking.
//!
//! Pipe file descriptors survive `fork`, so the same `FlowControl` value is
//! usable from the producer and from every forked worker.
//!
//! [`AckChannel`] is a one-shot pipe a freshly spawned worker uses to tell
//! its spawner that it has taken ownership of its phase.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use crate::error::{Result, TransportError};

/// The token written for every signal. No payload semantics.
const TOKEN: [u8; 4] = 1u32.to_le_bytes();

fn pipe() -> io::Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds is a valid two-element buffer.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe() returned two fresh descriptors that nothing else owns.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((File::from(read), File::from(write)))
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: fd is open for the lifetime of `file`.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Wait until `file` is readable or `timeout` elapses. `None` waits forever.
///
/// Returns `Ok(false)` on timeout or when interrupted by a signal.
fn poll_readable(file: &File, timeout: Option<Duration>) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = match timeout {
        Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };

    // SAFETY: pfd points to one valid pollfd.
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }

    // POLLHUP also counts: the following read reports EOF.
    Ok(ret > 0 && pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0)
}

/// Read exactly one token.
fn read_token(mut file: &File) -> Result<()> {
    let mut buf = [0u8; TOKEN.len()];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => return Err(TransportError::ChannelClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Channel(e)),
        }
    }
    Ok(())
}

fn write_token(mut file: &File) -> Result<()> {
    loop {
        match file.write(&TOKEN) {
            Ok(n) if n == TOKEN.len() => return Ok(()),
            Ok(_) => {
                return Err(TransportError::Channel(io::Error::new(
                    ErrorKind::WriteZero,
                    "short token write",
                )));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Channel(e)),
        }
    }
}

/// The `ready` / `done` channel pair.
pub struct FlowControl {
    ready_rx: File,
    ready_tx: File,
    done_rx: File,
    done_tx: File,
}

impl FlowControl {
    pub fn new() -> Result<Self> {
        let (ready_rx, ready_tx) = pipe().map_err(TransportError::Channel)?;
        let (done_rx, done_tx) = pipe().map_err(TransportError::Channel)?;
        set_nonblocking(&done_rx).map_err(TransportError::Channel)?;

        Ok(Self {
            ready_rx,
            ready_tx,
            done_rx,
            done_tx,
        })
    }

    /// Producer: announce a swapped buffer. Never blocks in practice; the
    /// pipe holds far more tokens than can ever be outstanding.
    pub fn signal_ready(&self) -> Result<()> {
        write_token(&self.ready_tx)
    }

    /// Sender: block until a ready token arrives, then consume it.
    pub fn wait_ready(&self) -> Result<()> {
        loop {
            if poll_readable(&self.ready_rx, None).map_err(TransportError::Channel)? {
                return read_token(&self.ready_rx);
            }
        }
    }

    /// Sender: wait at most `timeout` for a ready token.
    ///
    /// Returns `Ok(true)` if a token was consumed, `Ok(false)` on timeout or
    /// signal interruption.
    pub fn wait_ready_timeout(&self, timeout: Duration) -> Result<bool> {
        if !poll_readable(&self.ready_rx, Some(timeout)).map_err(TransportError::Channel)? {
            return Ok(false);
        }
        read_token(&self.ready_rx)?;
        Ok(true)
    }

    /// Consume a pending ready token without waiting, if there is one.
    pub fn try_take_ready(&self) -> Result<bool> {
        self.wait_ready_timeout(Duration::ZERO)
    }

    /// Sender: announce that the transmission attempt finished.
    pub fn signal_done(&self) -> Result<()> {
        write_token(&self.done_tx)
    }

    /// Producer: consume at most one done token without blocking.
    pub fn poll_done(&self) -> Result<bool> {
        let mut buf = [0u8; TOKEN.len()];
        loop {
            match (&self.done_rx).read(&mut buf) {
                Ok(0) => return Err(TransportError::ChannelClosed),
                Ok(n) if n == TOKEN.len() => return Ok(true),
                Ok(_) => {
                    return Err(TransportError::Channel(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "partial done token",
                    )));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Channel(e)),
            }
        }
    }
}

/// One-shot startup acknowledgment between a spawner and a new worker.
pub struct AckChannel {
    rx: Option<File>,
    tx: Option<File>,
}

impl AckChannel {
    pub fn new() -> Result<Self> {
        let (rx, tx) = pipe().map_err(TransportError::Channel)?;
        Ok(Self {
            rx: Some(rx),
            tx: Some(tx),
        })
    }

    /// Worker side: report that startup completed.
    pub fn acknowledge(&mut self) -> Result<()> {
        self.rx.take();
        match self.tx.take() {
            Some(tx) => write_token(&tx),
            None => Ok(()),
        }
    }

    /// Spawner side: wait for the worker's acknowledgment.
    ///
    /// Drops the spawner's copy of the write end first, so a worker that
    /// exits before acknowledging produces EOF instead of a timeout.
    /// Returns `Ok(false)` if nothing arrived in time or the worker went
    /// away.
    pub fn wait(&mut self, timeout: Duration) -> Result<bool> {
        self.tx.take();
        let Some(rx) = self.rx.take() else {
            return Ok(false);
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if poll_readable(&rx, Some(remaining)).map_err(TransportError::Channel)? {
                return match read_token(&rx) {
                    Ok(()) => Ok(true),
                    Err(TransportError::ChannelClosed) => Ok(false),
                    Err(e) => Err(e),
                };
            }
            if remaining.is_zero() {
                return Ok(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_poll_done_without_signal() {
        let fc = FlowControl::new().unwrap();
        assert!(!fc.poll_done().unwrap());
    }

    #[test]
    fn test_poll_done_drains_one_token_per_call() {
        let fc = FlowControl::new().unwrap();
        fc.signal_done().unwrap();
        fc.signal_done().unwrap();

        assert!(fc.poll_done().unwrap());
        assert!(fc.poll_done().unwrap());
        assert!(!fc.poll_done().unwrap());
    }

    #[test]
    fn test_wait_ready_timeout_expires() {
        let fc = FlowControl::new().unwrap();
        assert!(!fc.wait_ready_timeout(Duration::from_millis(10)).unwrap());
        assert!(!fc.try_take_ready().unwrap());
    }

    #[test]
    fn test_wait_ready_wakes_on_signal() {
        let fc = std::sync::Arc::new(FlowControl::new().unwrap());
        let waiter = {
            let fc = fc.clone();
            thread::spawn(move || fc.wait_ready())
        };

        thread::sleep(Duration::from_millis(20));
        fc.signal_ready().unwrap();
        waiter.join().unwrap().unwrap();

        // The token was consumed exactly once
        assert!(!fc.try_take_ready().unwrap());
    }

    #[test]
    fn test_ack_received() {
        let mut ack = AckChannel::new().unwrap();
        let mut worker_side = AckChannel {
            rx: None,
            tx: ack.tx.as_ref().map(|f| f.try_clone().unwrap()),
        };
        worker_side.acknowledge().unwrap();
        assert!(ack.wait(Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn test_ack_eof_when_worker_gone() {
        let mut ack = AckChannel::new().unwrap();
        // No other write end exists once the spawner drops its own
        assert!(!ack.wait(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_ack_timeout() {
        let mut ack = AckChannel::new().unwrap();
        let _held_open = ack.tx.as_ref().map(|f| f.try_clone().unwrap());
        assert!(!ack.wait(Duration::from_millis(20)).unwrap());
    }
}

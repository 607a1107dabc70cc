//! Network transport used by the workers.
//!
//! The supervisor owns listen/accept/receive; the sender only ever calls
//! `send` on the connection it inherited when it was forked.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tracing::{debug, info};

/// Minimal connection-oriented transport with a single client.
pub trait Network {
    /// Start listening on `port`.
    fn listen(&mut self, port: u16) -> io::Result<()>;

    /// Block until one client connects.
    fn accept(&mut self) -> io::Result<()>;

    /// Send some prefix of `bytes`, returning how many were written.
    fn send(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Receive into `buf`. `Ok(0)` means the peer closed the connection;
    /// `WouldBlock`/`TimedOut` mean nothing arrived within the poll interval.
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Shut down and drop the client connection. The listener stays open.
    fn shutdown(&mut self);

    fn has_listener(&self) -> bool;

    fn has_client(&self) -> bool;
}

/// Returns true for receive errors that only mean "nothing yet".
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// TCP implementation of [`Network`].
pub struct TcpNetwork {
    listener: Option<Socket>,
    client: Option<Socket>,
    send_timeout: Duration,
    recv_timeout: Duration,
}

impl TcpNetwork {
    pub fn new(send_timeout: Duration, recv_timeout: Duration) -> Self {
        Self {
            listener: None,
            client: None,
            send_timeout,
            recv_timeout,
        }
    }

    /// Address the listener is bound to, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .and_then(|a| a.as_socket())
    }

    fn configure_client(&self, socket: &Socket) -> io::Result<()> {
        // Frames are written in two parts; don't let Nagle hold the payload
        socket.set_nodelay(true)?;
        socket.set_write_timeout(Some(self.send_timeout))?;
        socket.set_read_timeout(Some(self.recv_timeout))?;
        Ok(())
    }
}

impl Network for TcpNetwork {
    fn listen(&mut self, port: u16) -> io::Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        socket.bind(&addr.into())?;
        socket.listen(1)?;

        info!("Listening for viewer on TCP {}", addr);
        self.listener = Some(socket);
        Ok(())
    }

    fn accept(&mut self) -> io::Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not listening"))?;

        let (socket, addr) = listener.accept()?;
        self.configure_client(&socket)?;

        info!("Viewer connected from {:?}", addr.as_socket());
        self.client = Some(socket);
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no client"))?;
        // MSG_NOSIGNAL: a closed peer is an error, not a SIGPIPE
        client.send_with_flags(bytes, libc::MSG_NOSIGNAL)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut client = self
            .client
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no client"))?;
        client.read(buf)
    }

    fn shutdown(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.shutdown(Shutdown::Both) {
                debug!("Client shutdown: {}", e);
            }
        }
    }

    fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    fn has_client(&self) -> bool {
        self.client.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;
    use std::thread;

    fn listening() -> (TcpNetwork, SocketAddr) {
        let mut net = TcpNetwork::new(Duration::from_secs(1), Duration::from_millis(50));
        // Port 0 lets the OS pick; validation only applies to configured ports
        net.listen(0).unwrap();
        let port = net.local_addr().unwrap().port();
        (net, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_accept_send_receive() {
        let (mut net, addr) = listening();
        assert!(net.has_listener());
        assert!(!net.has_client());

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        net.accept().unwrap();
        assert!(net.has_client());

        let mut buf = [0u8; 16];
        let mut n = 0;
        while n < 4 {
            match net.receive(&mut buf[n..]) {
                Ok(read) => n += read,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => panic!("receive failed: {}", e),
            }
        }
        assert_eq!(&buf[..4], b"ping");

        let mut sent = 0;
        while sent < 4 {
            sent += net.send(&b"pong"[sent..]).unwrap();
        }
        assert_eq!(&client.join().unwrap(), b"pong");
    }

    #[test]
    fn test_receive_times_out_without_data() {
        let (mut net, addr) = listening();
        let _stream = TcpStream::connect(addr).unwrap();
        net.accept().unwrap();

        let mut buf = [0u8; 16];
        let err = net.receive(&mut buf).unwrap_err();
        assert!(is_timeout(&err));
    }

    #[test]
    fn test_peer_close_reads_zero() {
        let (mut net, addr) = listening();
        let stream = TcpStream::connect(addr).unwrap();
        net.accept().unwrap();
        drop(stream);

        let mut buf = [0u8; 16];
        loop {
            match net.receive(&mut buf) {
                Ok(0) => break,
                Ok(_) => panic!("unexpected data"),
                Err(e) if is_timeout(&e) => continue,
                Err(_) => break,
            }
        }
    }

    #[test]
    fn test_shutdown_drops_client_keeps_listener() {
        let (mut net, addr) = listening();
        let _stream = TcpStream::connect(addr).unwrap();
        net.accept().unwrap();

        net.shutdown();
        assert!(!net.has_client());
        assert!(net.has_listener());
        assert!(net.send(b"x").is_err());
    }
}

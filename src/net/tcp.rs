//! `TcpSocket`: the state machine behind the `socket`/`bind`/`listen`/
//! `accept`/`send`/`recv` syscalls. Deliberately has no wire format —
//! a real network stack is out of scope; this just gives the syscall
//! layer something to block on and something a test can drive from
//! both "ends" without a NIC.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::sync::{CondVar, SpinLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynRcvd,
    Established,
    CloseWait,
}

struct Inner {
    state: TcpState,
    port: Option<u16>,
    /// Listening sockets only: connections accepted but not yet handed
    /// out to `accept()`.
    pending: VecDeque<Arc<TcpSocket>>,
    /// Established sockets only: bytes written by the peer, waiting to
    /// be `recv`'d.
    inbox: Vec<u8>,
    /// The other end of an established connection, so `send` can reach
    /// its peer's inbox directly.
    peer: Option<Arc<TcpSocket>>,
    /// Accepted connection sockets only: the remote IPv4 address and port
    /// the connection arrived from, both already in network byte order
    /// (spec §6 "Network socket addresses") — this is what `accept`
    /// writes back into its caller's `addr` out-parameter.
    remote_addr: Option<([u8; 4], [u8; 2])>,
}

/// A socket. The condvar is notified on every state transition and every
/// inbox append, so `accept`/`recv` can block on "has anything changed"
/// without busy-polling.
pub struct TcpSocket {
    inner: SpinLock<Inner>,
    changed: CondVar,
}

#[derive(Debug)]
pub enum TcpError {
    AlreadyBound,
    NotBound,
    NotListening,
    NotConnected,
}

impl TcpSocket {
    pub fn new() -> Arc<TcpSocket> {
        Arc::new(TcpSocket {
            inner: SpinLock::new(Inner {
                state: TcpState::Closed,
                port: None,
                pending: VecDeque::new(),
                inbox: Vec::new(),
                peer: None,
                remote_addr: None,
            }),
            changed: CondVar::new(),
        })
    }

    pub fn state(&self) -> TcpState {
        self.inner.lock().state
    }

    /// Remote IPv4 address/port of an accepted connection, or `None` for
    /// a socket that was never the server side of one (listening sockets,
    /// or a socket that hasn't had a peer address recorded).
    pub fn remote_addr(&self) -> Option<([u8; 4], [u8; 2])> {
        self.inner.lock().remote_addr
    }

    pub fn bind(&self, port: u16) -> Result<(), TcpError> {
        let mut inner = self.inner.lock();
        if inner.port.is_some() {
            return Err(TcpError::AlreadyBound);
        }
        inner.port = Some(port);
        Ok(())
    }

    pub fn listen(&self) -> Result<(), TcpError> {
        let mut inner = self.inner.lock();
        if inner.port.is_none() {
            return Err(TcpError::NotBound);
        }
        inner.state = TcpState::Listen;
        Ok(())
    }

    /// Non-blocking: pop a connection off the accept queue, or `None` if
    /// nothing is waiting yet. The syscall layer wraps this in a condvar
    /// wait loop to actually block.
    pub fn find_ready_client(&self) -> Option<Arc<TcpSocket>> {
        self.inner.lock().pending.pop_front()
    }

    pub fn available(&self) -> usize {
        self.inner.lock().inbox.len()
    }

    /// Read up to `buf.len()` queued bytes, draining them. Returns 0 on a
    /// socket with nothing queued — the syscall layer is responsible for
    /// blocking until `available() > 0` or the peer has closed.
    pub fn recv(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let n = buf.len().min(inner.inbox.len());
        buf[..n].copy_from_slice(&inner.inbox[..n]);
        inner.inbox.drain(..n);
        n
    }

    /// Append `buf` to the peer's inbox and wake anyone blocked in its
    /// `recv`.
    pub fn send(&self, buf: &[u8]) -> Result<usize, TcpError> {
        let peer = {
            let inner = self.inner.lock();
            if inner.state != TcpState::Established {
                return Err(TcpError::NotConnected);
            }
            inner.peer.clone().ok_or(TcpError::NotConnected)?
        };
        peer.inner.lock().inbox.extend_from_slice(buf);
        peer.changed.notify_all();
        Ok(buf.len())
    }

    /// Half-close: stop accepting new data, mark `CloseWait` so a peer's
    /// next `recv` can observe end-of-stream once the inbox drains.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.state = TcpState::CloseWait;
        if let Some(peer) = inner.peer.take() {
            peer.changed.notify_all();
        }
        self.changed.notify_all();
    }

    /// Return an established connection socket to `Listen` so the same
    /// port keeps accepting further clients (spec's accept/close/relisten
    /// scenario) instead of requiring a fresh `bind`.
    pub fn close_and_relisten(&self) {
        let mut inner = self.inner.lock();
        let port = inner.port;
        inner.state = TcpState::Listen;
        inner.port = port;
        inner.peer = None;
        inner.inbox.clear();
        self.changed.notify_all();
    }

    pub fn wait_for_change(self: &Arc<Self>, timeout_ticks: u64) -> bool {
        let guard = self.inner.lock();
        let (_guard, woken) = self.changed.wait_timeout(guard, &self.inner, timeout_ticks);
        woken
    }

    /// Test-only: simulate an external client connecting to `listener`,
    /// establishing a fresh paired socket and enqueuing it for `accept`.
    /// The server-side socket records a loopback remote address, standing
    /// in for the peer address a real IP layer (out of scope) would have
    /// parsed off the SYN.
    #[cfg(any(test, feature = "test-harness"))]
    pub fn simulate_client_connect(listener: &Arc<TcpSocket>) -> Arc<TcpSocket> {
        let server_side = TcpSocket::new();
        let client_side = TcpSocket::new();

        {
            let mut s = server_side.inner.lock();
            s.state = TcpState::Established;
            s.peer = Some(client_side.clone());
            s.remote_addr = Some(([127, 0, 0, 1], 1024u16.to_be_bytes()));
        }
        {
            let mut c = client_side.inner.lock();
            c.state = TcpState::Established;
            c.peer = Some(server_side.clone());
        }

        listener.inner.lock().pending.push_back(server_side);
        listener.changed.notify_all();
        client_side
    }
}

#[cfg(not(target_os = "none"))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_then_listen_transitions_state() {
        let sock = TcpSocket::new();
        sock.bind(8080).unwrap();
        sock.listen().unwrap();
        assert_eq!(sock.state(), TcpState::Listen);
    }

    #[test]
    fn double_bind_fails() {
        let sock = TcpSocket::new();
        sock.bind(8080).unwrap();
        assert!(sock.bind(8081).is_err());
    }

    #[test]
    fn simulated_client_connect_is_acceptable() {
        let listener = TcpSocket::new();
        listener.bind(9000).unwrap();
        listener.listen().unwrap();
        assert!(listener.find_ready_client().is_none());

        let _client = TcpSocket::simulate_client_connect(&listener);
        let accepted = listener.find_ready_client().expect("pending connection");
        assert_eq!(accepted.state(), TcpState::Established);
        assert_eq!(accepted.remote_addr(), Some(([127, 0, 0, 1], 1024u16.to_be_bytes())));
    }

    #[test]
    fn send_and_recv_round_trip() {
        let listener = TcpSocket::new();
        listener.bind(9001).unwrap();
        listener.listen().unwrap();
        let client = TcpSocket::simulate_client_connect(&listener);
        let server = listener.find_ready_client().unwrap();

        client.send(b"hello").unwrap();
        let mut buf = [0u8; 5];
        let n = server.recv(&mut buf);
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn close_and_relisten_allows_further_accepts() {
        let listener = TcpSocket::new();
        listener.bind(9002).unwrap();
        listener.listen().unwrap();
        let _first_client = TcpSocket::simulate_client_connect(&listener);
        let first_server_side = listener.find_ready_client().unwrap();
        first_server_side.close_and_relisten();
        assert_eq!(first_server_side.state(), TcpState::Listen);
    }
}

//! Peer-to-peer handshake: a two-message TCP exchange of NIC paths and QP
//! numbers (§4.1, §6 "Handshake wire format").

use std::io::Write as _;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener as MioTcpListener;
use mio::{Events, Interest, Poll, Token};
use serde::{Deserialize, Serialize};

use mooncake_common::{MooncakeError, MooncakeResult};

use crate::wire::{read_message, write_message};

const SOCKET_TIMEOUT: Duration = Duration::from_secs(60);
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const LISTENER_TOKEN: Token = Token(0);

/// The handshake request/response document (§6). A non-empty `reply_msg`
/// in the response means the responder rejected the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeDesc {
    pub local_nic_path: String,
    pub peer_nic_path: String,
    pub qp_num: Vec<u32>,
    #[serde(default)]
    pub reply_msg: String,
}

impl HandshakeDesc {
    pub fn accepted(&self) -> bool {
        self.reply_msg.is_empty()
    }
}

/// Connects to `peer_addr` (host:port), sends `local_desc`, reads and
/// returns the peer's response, then closes the connection. Each socket
/// operation has a 60 s timeout.
pub fn send_handshake(peer_addr: &str, local_desc: &HandshakeDesc) -> MooncakeResult<HandshakeDesc> {
    let addr = peer_addr
        .to_socket_addrs()
        .map_err(|_| MooncakeError::DnsFail(peer_addr.to_string()))?
        .next()
        .ok_or_else(|| MooncakeError::DnsFail(peer_addr.to_string()))?;

    let mut stream = TcpStream::connect_timeout(&addr, SOCKET_TIMEOUT)?;
    stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;

    write_message(&mut stream, local_desc)?;
    let response: HandshakeDesc = read_message(&mut stream)?;

    if !response.accepted() {
        return Err(MooncakeError::RejectHandshake(response.reply_msg));
    }
    Ok(response)
}

/// A running handshake listener. Dropping or calling [`HandshakeDaemon::shutdown`]
/// signals the accept loop to stop after its current accept cycle and
/// joins the listener thread.
pub struct HandshakeDaemon {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HandshakeDaemon {
    /// Spawns the listener thread. `callback` is invoked with each
    /// accepted peer's `HandshakeDesc` and must return the local
    /// response to send back (with `reply_msg` set to reject).
    pub fn start<F>(port: u16, callback: F) -> MooncakeResult<Self>
    where
        F: Fn(HandshakeDesc) -> HandshakeDesc + Send + Sync + 'static,
    {
        let addr = format!("0.0.0.0:{port}")
            .parse()
            .map_err(|_| MooncakeError::invalid_argument("invalid handshake port"))?;
        let mut listener = MioTcpListener::bind(addr)?;

        let mut poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("mc-handshake".into())
            .spawn(move || Self::accept_loop(poll, listener, &worker_shutdown, &callback))
            .map_err(|e| MooncakeError::context(format!("failed to spawn handshake daemon: {e}")))?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    fn accept_loop<F>(
        mut poll: Poll,
        listener: MioTcpListener,
        shutdown: &AtomicBool,
        callback: &F,
    ) where
        F: Fn(HandshakeDesc) -> HandshakeDesc,
    {
        let mut events = Events::with_capacity(16);
        while !shutdown.load(Ordering::Acquire) {
            if let Err(err) = poll.poll(&mut events, Some(ACCEPT_POLL_TIMEOUT)) {
                tracing::warn!(%err, "handshake listener poll failed");
                continue;
            }
            for event in &events {
                if event.token() != LISTENER_TOKEN {
                    continue;
                }
                loop {
                    match listener.accept() {
                        Ok((stream, _peer)) => Self::handle_connection(stream, callback),
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            tracing::warn!(%err, "handshake accept failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_connection<F>(stream: mio::net::TcpStream, callback: &F)
    where
        F: Fn(HandshakeDesc) -> HandshakeDesc,
    {
        // SAFETY: `stream` owns a valid, open socket fd; we immediately
        // take exclusive ownership of it via `from_raw_fd` and never
        // touch the mio handle again.
        let mut std_stream = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };
        if std_stream.set_nonblocking(false).is_err() {
            return;
        }
        let _ = std_stream.set_read_timeout(Some(SOCKET_TIMEOUT));
        let _ = std_stream.set_write_timeout(Some(SOCKET_TIMEOUT));

        let request: HandshakeDesc = match read_message(&mut std_stream) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(%err, "malformed handshake request");
                return;
            }
        };

        let response = callback(request);
        if let Err(err) = write_message(&mut std_stream, &response) {
            tracing::warn!(%err, "failed to write handshake response");
        }
        let _ = std_stream.flush();
    }

    /// Signals the accept loop to stop and waits for the current accept
    /// cycle (bounded by the 1 s poll timeout) to finish.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HandshakeDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU16;

    static NEXT_PORT: AtomicU16 = AtomicU16::new(22100);

    fn test_port() -> u16 {
        NEXT_PORT.fetch_add(1, Ordering::Relaxed)
    }

    #[test]
    fn handshake_round_trip_succeeds() {
        let port = test_port();
        let daemon = HandshakeDaemon::start(port, |req| HandshakeDesc {
            local_nic_path: req.peer_nic_path.clone(),
            peer_nic_path: req.local_nic_path.clone(),
            qp_num: vec![99],
            reply_msg: String::new(),
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));

        let local = HandshakeDesc {
            local_nic_path: "node-a@mlx5_0".into(),
            peer_nic_path: "node-b@mlx5_0".into(),
            qp_num: vec![1, 2],
            reply_msg: String::new(),
        };
        let response = send_handshake(&format!("127.0.0.1:{port}"), &local).unwrap();
        assert!(response.accepted());
        assert_eq!(response.qp_num, vec![99]);

        drop(daemon);
    }

    #[test]
    fn rejected_handshake_surfaces_reply_msg() {
        let port = test_port();
        let daemon = HandshakeDaemon::start(port, |_req| HandshakeDesc {
            local_nic_path: String::new(),
            peer_nic_path: String::new(),
            qp_num: vec![],
            reply_msg: "busy".into(),
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));

        let local = HandshakeDesc {
            local_nic_path: "node-a@mlx5_0".into(),
            peer_nic_path: "node-b@mlx5_0".into(),
            qp_num: vec![1],
            reply_msg: String::new(),
        };
        let err = send_handshake(&format!("127.0.0.1:{port}"), &local).unwrap_err();
        assert!(matches!(err, MooncakeError::RejectHandshake(msg) if msg == "busy"));

        drop(daemon);
    }

    #[test]
    fn connecting_to_closed_port_fails() {
        let err = send_handshake(
            "127.0.0.1:1",
            &HandshakeDesc {
                local_nic_path: String::new(),
                peer_nic_path: String::new(),
                qp_num: vec![],
                reply_msg: String::new(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, MooncakeError::SocketFail(_)));
    }
}

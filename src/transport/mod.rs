//! Framed TCP transport between peers.
//!
//! Each frame is a 4-byte big-endian length prefix followed by the payload. The first 4 bytes on
//! any newly accepted or dialed connection are the sender's node-ID, also big-endian `u32`.
//! `TcpTransport` is the concrete, TCP-backed implementation; the handshake and framing are kept
//! independent of socket kind so an alternate transport could be substituted without touching
//! callers.

pub mod codec;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::error::{Error, Result};

const HANDSHAKE_LEN: usize = 4;
const MAX_FRAME_BYTES: u32 = 8 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const READ_DEADLINE: Duration = Duration::from_secs(30);
const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);

pub type PeerId = u32;

struct Connection {
    stream: Mutex<TcpStream>,
}

/// Reliable, ordered, point-to-point framed messaging between peers.
pub struct TcpTransport {
    local_id: PeerId,
    connections: Mutex<HashMap<PeerId, Arc<Connection>>>,
    incoming_tx: Sender<(PeerId, Vec<u8>)>,
    incoming_rx: Receiver<(PeerId, Vec<u8>)>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl TcpTransport {
    pub fn new(local_id: PeerId) -> Self {
        let (tx, rx) = unbounded();
        TcpTransport {
            local_id,
            connections: Mutex::new(HashMap::new()),
            incoming_tx: tx,
            incoming_rx: rx,
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Accepts inbound peer connections on `addr:port`. The first 4 bytes of each accepted
    /// stream are the sender's node-ID; the connection is registered for that peer, overwriting
    /// (and closing) any prior entry.
    pub fn listen(self: &Arc<Self>, addr: &str, port: u16) -> Result<()> {
        let listener = TcpListener::bind((addr, port))?;
        info!("transport listening on {}:{}", addr, port);
        let this = self.clone();
        thread::Builder::new()
            .name("transport-accept".to_string())
            .spawn(move || {
                for incoming in listener.incoming() {
                    if this.shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                        break;
                    }
                    match incoming {
                        Ok(stream) => this.accept(stream),
                        Err(err) => warn!("accept error: {}", err),
                    }
                }
            })?;
        Ok(())
    }

    fn accept(self: &Arc<Self>, mut stream: TcpStream) {
        let mut header = [0u8; HANDSHAKE_LEN];
        if stream.read_exact(&mut header).is_err() {
            warn!("peer handshake failed: connection closed before header");
            return;
        }
        let peer_id = u32::from_be_bytes(header);
        self.register(peer_id, stream);
    }

    /// Dials `addr:port` with a 1s connect timeout, sends the local node-ID, and registers the
    /// connection. Retries up to 5 times with exponential backoff starting at 2s. Skipped if a
    /// live connection for `peer_id` already exists.
    pub fn connect(self: &Arc<Self>, peer_id: PeerId, addr: &str, port: u16) -> Result<()> {
        if self.connections.lock().unwrap().contains_key(&peer_id) {
            return Ok(());
        }
        let socket_addr: SocketAddr = format!("{}:{}", addr, port)
            .parse()
            .map_err(|_| Error::InvalidParameter(format!("bad address {}:{}", addr, port)))?;

        let mut delay = RECONNECT_BASE_DELAY;
        let mut last_err = None;
        for attempt in 0..RECONNECT_ATTEMPTS {
            match TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT) {
                Ok(mut stream) => {
                    if stream.write_all(&self.local_id.to_be_bytes()).is_ok() {
                        self.register(peer_id, stream);
                        return Ok(());
                    }
                }
                Err(err) => {
                    debug!(
                        "connect attempt {} to peer {} failed: {}",
                        attempt + 1,
                        peer_id,
                        err
                    );
                    last_err = Some(err);
                }
            }
            thread::sleep(delay);
            delay *= 2;
        }
        Err(Error::NetworkError(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    fn register(self: &Arc<Self>, peer_id: PeerId, stream: TcpStream) {
        let _ = stream.set_read_timeout(Some(READ_DEADLINE));
        let conn = Arc::new(Connection {
            stream: Mutex::new(stream.try_clone().expect("clone tcp stream")),
        });
        {
            let mut conns = self.connections.lock().unwrap();
            conns.insert(peer_id, conn);
        }
        self.spawn_reader(peer_id, stream);
    }

    fn spawn_reader(self: &Arc<Self>, peer_id: PeerId, mut stream: TcpStream) {
        let this = self.clone();
        let _ = thread::Builder::new()
            .name(format!("transport-read-{}", peer_id))
            .spawn(move || loop {
                if this.shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                    break;
                }
                let mut len_buf = [0u8; 4];
                if stream.read_exact(&mut len_buf).is_err() {
                    break;
                }
                let len = u32::from_be_bytes(len_buf);
                if len > MAX_FRAME_BYTES {
                    warn!("dropping oversized frame ({} bytes) from peer {}", len, peer_id);
                    break;
                }
                let mut payload = vec![0u8; len as usize];
                if stream.read_exact(&mut payload).is_err() {
                    break;
                }
                if this.incoming_tx.send((peer_id, payload)).is_err() {
                    break;
                }
            });
    }

    /// Writes a 4-byte big-endian length prefix then `payload` as a single atomic operation.
    pub fn send(&self, peer_id: PeerId, payload: &[u8]) -> Result<()> {
        let conn = {
            let conns = self.connections.lock().unwrap();
            conns.get(&peer_id).cloned()
        };
        let conn = conn.ok_or(Error::NetworkError(format!("no connection to {}", peer_id)))?;
        let mut stream = conn.stream.lock().unwrap();
        let len = payload.len() as u32;
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(payload);
        let written = stream.write(&framed)?;
        if written != framed.len() {
            return Err(Error::NetworkError("partial write".to_string()));
        }
        Ok(())
    }

    /// Sends to every currently connected peer concurrently. Per-peer failures are reported but
    /// do not abort the broadcast.
    pub fn broadcast(&self, payload: &[u8]) -> Vec<(PeerId, Result<()>)> {
        let peers: Vec<PeerId> = self.connections.lock().unwrap().keys().copied().collect();
        let handles: Vec<_> = peers
            .into_iter()
            .map(|peer_id| {
                let payload = payload.to_vec();
                let conn = self.connections.lock().unwrap().get(&peer_id).cloned();
                thread::spawn(move || {
                    let result = match conn {
                        Some(conn) => {
                            let mut stream = conn.stream.lock().unwrap();
                            let len = payload.len() as u32;
                            let mut framed = Vec::with_capacity(4 + payload.len());
                            framed.extend_from_slice(&len.to_be_bytes());
                            framed.extend_from_slice(&payload);
                            stream
                                .write_all(&framed)
                                .map_err(|e| Error::NetworkError(e.to_string()))
                        }
                        None => Err(Error::NetworkError("no connection".to_string())),
                    };
                    (peer_id, result)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    /// Drains framed payloads received since the last call. Never blocks.
    pub fn try_recv_all(&self) -> Vec<(PeerId, Vec<u8>)> {
        let mut out = Vec::new();
        while let Ok(item) = self.incoming_rx.try_recv() {
            out.push(item);
        }
        out
    }

    pub fn disconnect(&self, peer_id: PeerId) {
        self.connections.lock().unwrap().remove(&peer_id);
    }

    pub fn is_connected(&self, peer_id: PeerId) -> bool {
        self.connections.lock().unwrap().contains_key(&peer_id)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.lock().unwrap().keys().copied().collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        self.connections.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn send_without_connection_fails() {
        let transport = Arc::new(TcpTransport::new(1));
        let err = transport.send(99, b"hi");
        assert!(err.is_err());
    }

    #[test]
    fn handshake_and_roundtrip() {
        let listener_transport = Arc::new(TcpTransport::new(1));
        listener_transport
            .listen("127.0.0.1", 17345)
            .expect("listen");
        thread::sleep(Duration::from_millis(100));

        let dialer_transport = Arc::new(TcpTransport::new(2));
        dialer_transport
            .connect(1, "127.0.0.1", 17345)
            .expect("connect");
        thread::sleep(Duration::from_millis(100));

        dialer_transport.send(1, b"hello").expect("send");
        thread::sleep(Duration::from_millis(200));

        let received = listener_transport.try_recv_all();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, 2);
        assert_eq!(received[0].1, b"hello");

        let _ = IpAddr::V4(Ipv4Addr::LOCALHOST);
    }
}

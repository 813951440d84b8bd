//! tokio-backed line transport.
//!
//! A reader task splits the socket into lines and pushes them onto a bounded
//! [`HandoffQueue`]; a writer task drains an unbounded channel. The
//! [`LineTransport`] side never blocks, so it can be polled while the bridge
//! lock is held.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::handoff::HandoffQueue;
use crate::traits::LineTransport;

/// Lines buffered between the reader task and the core.
pub const INBOUND_CAPACITY: usize = 64;

type Inbox = Arc<Mutex<HandoffQueue<String, INBOUND_CAPACITY>>>;

/// A line-oriented TCP connection.
pub struct TcpLineTransport {
    inbound: Inbox,
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    peer: String,
}

impl TcpLineTransport {
    /// Connect to `host:port`.
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an accepted or connected stream. Must be called inside a tokio
    /// runtime.
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| String::from("?"));
        let (read_half, mut write_half) = stream.into_split();
        let inbound: Inbox = Arc::new(Mutex::new(HandoffQueue::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let (outbound, mut rx) = mpsc::unbounded_channel::<String>();

        let reader = {
            let inbound = Arc::clone(&inbound);
            let connected = Arc::clone(&connected);
            let peer = peer.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(read_half).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim_end_matches('\r');
                            if line.is_empty() {
                                continue;
                            }
                            let mut queue = inbound.lock().unwrap_or_else(PoisonError::into_inner);
                            match queue.push(line.to_string()) {
                                Ok(None) => {}
                                Ok(Some(shed)) => debug!("[tcp] {} shed keepalive {:?}", peer, shed),
                                Err(rejected) => warn!("[tcp] {} inbox full, dropped {:?}", peer, rejected),
                            }
                        }
                        Ok(None) => {
                            debug!("[tcp] {} closed by peer", peer);
                            break;
                        }
                        Err(err) => {
                            warn!("[tcp] {} read failed: {}", peer, err);
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::Release);
            })
        };

        {
            let connected = Arc::clone(&connected);
            let peer = peer.clone();
            tokio::spawn(async move {
                while let Some(mut line) = rx.recv().await {
                    line.push('\n');
                    if let Err(err) = write_half.write_all(line.as_bytes()).await {
                        warn!("[tcp] {} write failed: {}", peer, err);
                        break;
                    }
                }
                connected.store(false, Ordering::Release);
            });
        }

        Self {
            inbound,
            outbound,
            connected,
            reader,
            peer,
        }
    }

    /// Remote address.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Lines dropped because the inbox was full.
    pub fn rejected_count(&self) -> u32 {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rejected_count()
    }
}

impl LineTransport for TcpLineTransport {
    type Error = io::Error;

    fn send_line(&mut self, line: &str) -> Result<(), io::Error> {
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        self.outbound
            .send(line.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer stopped"))
    }

    fn try_recv_line(&mut self) -> Option<String> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Drop for TcpLineTransport {
    fn drop(&mut self) {
        // The writer stops on its own once the sender is dropped.
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn recv(link: &mut TcpLineTransport) -> Option<String> {
        for _ in 0..100 {
            if let Some(line) = link.try_recv_line() {
                return Some(line);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn lines_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut link = TcpLineTransport::connect("127.0.0.1", port).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        peer.write_all(b"VN2.0\r\nPPA1\n").await.unwrap();
        assert_eq!(recv(&mut link).await.as_deref(), Some("VN2.0"));
        assert_eq!(recv(&mut link).await.as_deref(), Some("PPA1"));

        link.send_line("NmThrottle").unwrap();
        let mut buf = [0u8; 11];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"NmThrottle\n");
    }

    #[tokio::test]
    async fn peer_close_is_observed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let link = TcpLineTransport::connect("127.0.0.1", port).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        for _ in 0..100 {
            if !link.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("close not observed");
    }
}

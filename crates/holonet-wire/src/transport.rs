//! Transport: the local listener and the per-link socket tasks.
//!
//! A [`Transport`] binds a TCP listener and accepts connections in a
//! background task. Accepted sockets wait in a channel until
//! [`Transport::process`] adopts them as Inbound links. Each socket gets a
//! reader task and a writer task that exchange frames with the link over
//! unbounded channels.

use crate::link::{LinkEvent, LinkIo, LinkTable, PeerLink};
use crate::message::{read_frame, write_frame, Frame};
use holonet_types::envelope::PeerRole;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Errors from the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
    #[error("Malformed frame: length {0} cannot hold an opcode")]
    MalformedFrame(u32),
    #[error("Connection to '{peer}' at {endpoint} failed: {reason}")]
    ConnectionFailed {
        peer: String,
        endpoint: String,
        reason: String,
    },
    #[error("Peer '{0}' already has a live link")]
    DuplicatePeer(String),
}

/// The local listening endpoint.
pub struct Transport {
    local_addr: SocketAddr,
    max_frame_size: u32,
    accepted: UnboundedReceiver<(TcpStream, SocketAddr)>,
    accept_task: JoinHandle<()>,
}

impl Transport {
    /// Bind the listener and start accepting in the background.
    pub async fn bind(address: &str, port: u16, max_frame_size: u32) -> Result<Self, WireError> {
        let listener = TcpListener::bind((address, port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Transport: listening on {}", local_addr);

        let (tx, rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(listener, tx));

        Ok(Self {
            local_addr,
            max_frame_size,
            accepted: rx,
            accept_task,
        })
    }

    /// Actual bound address (useful when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Adopt accepted sockets and move frames for every link. Never waits.
    pub fn process(&mut self, links: &mut LinkTable) {
        while let Ok((stream, addr)) = self.accepted.try_recv() {
            let io = spawn_link_io(stream, self.max_frame_size);
            let link = PeerLink::established(addr.to_string(), PeerRole::Inbound, io);
            if let Err(e) = links.insert(link) {
                warn!(%addr, error = %e, "Transport: rejected inbound connection");
            }
        }
        links.pump_all();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.accept_task.abort();
        debug!("Transport: listener on {} closed", self.local_addr);
    }
}

async fn accept_loop(listener: TcpListener, accepted: UnboundedSender<(TcpStream, SocketAddr)>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Transport: accepted connection from {}", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%addr, error = %e, "Transport: set_nodelay failed");
                }
                if accepted.send((stream, addr)).is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("Transport: accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

/// Start the reader and writer tasks for a connected socket.
pub fn spawn_link_io(stream: TcpStream, max_frame_size: u32) -> LinkIo {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (mut reader, writer) = stream.into_split();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let reader_events = events_tx.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader, max_frame_size).await {
                Ok(frame) => {
                    if reader_events.send(LinkEvent::Frame(frame)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let reason = match e {
                        WireError::ConnectionClosed => "peer closed connection".to_string(),
                        other => other.to_string(),
                    };
                    debug!(peer = %peer_addr, %reason, "Transport: reader stopped");
                    let _ = reader_events.send(LinkEvent::Closed {
                        reason,
                        undelivered: Vec::new(),
                    });
                    return;
                }
            }
        }
    });

    let writer_task = tokio::spawn(writer_loop(writer, out_rx, events_tx));

    LinkIo::new(events_rx, out_tx, Some(reader_task), Some(writer_task))
}

async fn writer_loop(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut outgoing: UnboundedReceiver<Frame>,
    events: UnboundedSender<LinkEvent>,
) {
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            outgoing.close();
            let mut undelivered = vec![frame];
            while let Ok(rest) = outgoing.try_recv() {
                undelivered.push(rest);
            }
            let _ = events.send(LinkEvent::Closed {
                reason: e.to_string(),
                undelivered,
            });
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Frame;
    use std::time::Duration;

    async fn settle<F: FnMut() -> bool>(mut done: F) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_inbound_connection_becomes_link() {
        let mut transport = Transport::bind("127.0.0.1", 0, 1024).await.unwrap();
        let mut links = LinkTable::new();

        let mut client = TcpStream::connect(transport.local_addr()).await.unwrap();
        write_frame(&mut client, &Frame::hello("zone")).await.unwrap();
        write_frame(&mut client, &Frame::new(42, &b"ping"[..]))
            .await
            .unwrap();

        settle(|| {
            transport.process(&mut links);
            links.by_peer("zone").map(|l| l.pending_inbound()) == Some(1)
        })
        .await;

        let link = links.by_peer("zone").expect("inbound link identified");
        assert_eq!(link.role(), PeerRole::Inbound);
        let id = link.id();
        let env = links.get_mut(id).unwrap().pop_inbound().unwrap();
        assert_eq!(env.opcode, 42);
        assert_eq!(&env.payload[..], b"ping");
        assert_eq!(env.link, id);
    }

    #[tokio::test]
    async fn test_outbound_frames_reach_socket() {
        let mut transport = Transport::bind("127.0.0.1", 0, 1024).await.unwrap();
        let mut links = LinkTable::new();
        let mut client = TcpStream::connect(transport.local_addr()).await.unwrap();

        settle(|| {
            transport.process(&mut links);
            !links.is_empty()
        })
        .await;
        let id = links.iter().next().unwrap().id();
        links
            .enqueue(holonet_types::envelope::Envelope::new(77, &b"pong"[..], id))
            .unwrap();
        transport.process(&mut links);

        let frame = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut client, 1024))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::new(77, &b"pong"[..]));
    }

    #[tokio::test]
    async fn test_peer_close_marks_link_closed() {
        let mut transport = Transport::bind("127.0.0.1", 0, 1024).await.unwrap();
        let mut links = LinkTable::new();
        let client = TcpStream::connect(transport.local_addr()).await.unwrap();
        settle(|| {
            transport.process(&mut links);
            !links.is_empty()
        })
        .await;

        drop(client);
        settle(|| {
            transport.process(&mut links);
            links.iter().all(|l| l.is_closed())
        })
        .await;

        let reaped = links.reap_closed();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].reason, "peer closed connection");
    }
}

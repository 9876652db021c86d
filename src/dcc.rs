//! Direct client-to-client sessions.
//!
//! DCC sessions ride a separate TCP connection negotiated over CTCP, so
//! their traffic never passes through the server or the outbound rate
//! limiter. The engine tracks offers as they arrive ([`PendingDcc`]) and
//! turns an accepted offer into a [`DccConnection`]: chat sessions yield
//! `dccmsg` events line by line, file transfers deliver raw chunks through
//! [`DccConnection::recv_bytes`] alongside `dccraw` progress events.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use slirc_wire::{ctcp, DccKind, DccOffer, DecodePolicy, LineBuffer, Source};

use crate::conn::Connection;
use crate::error::{ClientError, Result};
use crate::event::Event;

/// A DCC offer received over CTCP and not yet accepted.
#[derive(Clone, Debug)]
pub struct PendingDcc {
    /// Who sent the offer.
    pub source: Option<Source>,
    /// The parsed offer.
    pub offer: DccOffer,
}

enum DccOutbound {
    Data(Vec<u8>),
    Close,
}

struct DccInner {
    kind: DccKind,
    peer: Mutex<Option<SocketAddr>>,
    out_tx: mpsc::UnboundedSender<DccOutbound>,
    bytes_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: AtomicBool,
}

/// Handle to one direct session. Clones share the same socket.
#[derive(Clone)]
pub struct DccConnection {
    inner: Arc<DccInner>,
}

impl DccConnection {
    pub fn kind(&self) -> DccKind {
        self.inner.kind
    }

    /// The remote address, once the session is established. A passive
    /// (offered) session has no peer until the other side connects.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.inner.peer.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Send one chat line. The terminator is appended here.
    pub fn send_line(&self, line: &str) -> Result<()> {
        if line.contains(['\r', '\n', '\0']) {
            return Err(ClientError::Protocol(
                slirc_wire::ProtocolError::EmbeddedTerminator,
            ));
        }
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.send_bytes(&data)
    }

    /// Send raw bytes (file transfer payloads).
    pub fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.inner
            .out_tx
            .send(DccOutbound::Data(bytes.to_vec()))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Receive the next raw chunk. Returns `None` once the session ends.
    pub async fn recv_bytes(&self) -> Option<Vec<u8>> {
        self.inner.bytes_rx.lock().await.recv().await
    }

    /// Close the session. Queued writes drain first. Idempotent.
    pub fn close(&self) {
        let _ = self.inner.out_tx.send(DccOutbound::Close);
    }
}

impl Connection {
    /// Accept a pending offer by dialing the offerer.
    ///
    /// The offer is consumed; accepting it twice fails with
    /// [`ClientError::NoSuchOffer`].
    pub async fn dcc_accept(&self, offer: &PendingDcc) -> Result<DccConnection> {
        let pending = self
            .take_dcc_offer(&offer.offer.argument)
            .ok_or_else(|| ClientError::NoSuchOffer(offer.offer.argument.clone()))?;
        let addr = SocketAddr::new(IpAddr::V4(pending.offer.address), pending.offer.port);
        debug!(id = %self.id(), %addr, kind = %pending.offer.kind, "dcc accept");
        let stream = TcpStream::connect(addr).await?;
        let (dcc, out_rx, bytes_tx) = DccConnection::channel(pending.offer.kind);
        *dcc.inner.peer.lock() = Some(addr);
        tokio::spawn(run_dcc(self.clone(), dcc.clone(), stream, out_rx, bytes_tx));
        Ok(dcc)
    }

    /// Offer a chat session to `target` and listen for them to connect.
    pub async fn dcc_offer_chat(&self, target: &str) -> Result<DccConnection> {
        self.dcc_offer(target, DccKind::Chat, "chat", None).await
    }

    /// Offer a file transfer to `target` and listen for them to connect.
    pub async fn dcc_offer_file(
        &self,
        target: &str,
        name: &str,
        size: Option<u64>,
    ) -> Result<DccConnection> {
        self.dcc_offer(target, DccKind::Send, name, size).await
    }

    async fn dcc_offer(
        &self,
        target: &str,
        kind: DccKind,
        argument: &str,
        size: Option<u64>,
    ) -> Result<DccConnection> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let port = listener.local_addr()?.port();
        // Advertise the address the server connection is bound to; DCC is
        // IPv4-only on the wire.
        let address = match self.local_addr() {
            Some(SocketAddr::V4(v4)) => *v4.ip(),
            _ => Ipv4Addr::LOCALHOST,
        };
        let offer = DccOffer {
            kind,
            argument: argument.to_owned(),
            address,
            port,
            size,
        };
        self.privmsg(target, &ctcp::tagged("DCC", Some(&offer.to_string())))?;
        debug!(id = %self.id(), %target, %kind, port, "dcc offered");

        let (dcc, out_rx, bytes_tx) = DccConnection::channel(kind);
        let conn = self.clone();
        let handle = dcc.clone();
        tokio::spawn(async move {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    *handle.inner.peer.lock() = Some(peer);
                    run_dcc(conn, handle, stream, out_rx, bytes_tx).await;
                }
                Err(err) => {
                    warn!(id = %conn.id(), %err, "dcc accept failed");
                    handle.inner.closed.store(true, Ordering::Release);
                }
            }
        });
        Ok(dcc)
    }
}

impl DccConnection {
    fn channel(
        kind: DccKind,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<DccOutbound>,
        mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (bytes_tx, bytes_rx) = mpsc::unbounded_channel();
        let dcc = Self {
            inner: Arc::new(DccInner {
                kind,
                peer: Mutex::new(None),
                out_tx,
                bytes_rx: tokio::sync::Mutex::new(bytes_rx),
                closed: AtomicBool::new(false),
            }),
        };
        (dcc, out_rx, bytes_tx)
    }
}

async fn run_dcc(
    conn: Connection,
    dcc: DccConnection,
    stream: TcpStream,
    mut out_rx: mpsc::UnboundedReceiver<DccOutbound>,
    bytes_tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    let peer = dcc.peer_addr();
    let peer_label = peer.map(|p| p.to_string()).unwrap_or_default();
    conn.push_event(Event::internal(
        "dcc_connect",
        vec![dcc.kind().as_str().to_owned(), peer_label.clone()],
    ));

    let (mut read_half, mut write_half) = stream.into_split();
    let writer = tokio::spawn(async move {
        while let Some(item) = out_rx.recv().await {
            match item {
                DccOutbound::Data(data) => {
                    if let Err(err) = write_half.write_all(&data).await {
                        debug!(%err, "dcc write failed");
                        break;
                    }
                }
                DccOutbound::Close => break,
            }
        }
        let _ = write_half.shutdown().await;
    });

    let source = peer.map(|p| Source::new(p.to_string()));
    let mut lines = LineBuffer::new(DecodePolicy::Replace);
    let mut buf = vec![0u8; 8192];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => match dcc.kind() {
                DccKind::Chat => {
                    lines.feed(&buf[..n]);
                    while let Some(line) = lines.next_line() {
                        let line = match line {
                            Ok(line) => line,
                            Err(err) => {
                                trace!(%err, "dcc chat decode");
                                continue;
                            }
                        };
                        conn.push_event(Event::new(
                            "dccmsg",
                            source.clone(),
                            None,
                            vec![line],
                        ));
                    }
                }
                DccKind::Send => {
                    conn.push_event(Event::internal("dccraw", vec![n.to_string()]));
                    if bytes_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            },
            Err(err) => {
                debug!(%err, "dcc read failed");
                break;
            }
        }
    }

    dcc.inner.closed.store(true, Ordering::Release);
    writer.abort();
    conn.push_event(Event::internal(
        "dcc_disconnect",
        vec![dcc.kind().as_str().to_owned(), peer_label],
    ));
}

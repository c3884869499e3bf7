//! TCP transport.
//!
//! Frames are a 4-byte big-endian length followed by an encoded
//! [`ClusterEnvelope`]. The connecting side sends a `Connect` envelope first;
//! the accepting side learns the peer address and session id from it.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{SessionBridge, SessionConnector, SessionRequest};
use crate::error::ClusterResult;
use crate::message::ClusterEnvelope;
use crate::node::PeerAddress;
use crate::pool::DispatchPool;
use crate::session::{SessionCommand, SessionHandle};

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", frame.len()),
        ));
    }
    writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    writer.write_all(frame).await
}

/// Read one length-prefixed frame; `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

/// Opens outbound sessions over TCP
#[derive(Clone)]
pub struct TcpConnector {
    io: Arc<DispatchPool>,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Connector running its connections on the `io` pool
    pub fn new(io: Arc<DispatchPool>) -> Self {
        TcpConnector {
            io,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Override the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl SessionConnector for TcpConnector {
    fn connect(&self, request: SessionRequest, bridge: SessionBridge) {
        let timeout = self.connect_timeout;
        self.io.spawn(async move {
            let target = request.remote.socket_addr_string();
            debug!("[{}][{}] Connecting to {}", request.remote, request.session_id, target);
            let stream = match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    bridge.on_connect_failed(request.remote, request.session_id, e.to_string());
                    return;
                }
                Err(_) => {
                    bridge.on_connect_failed(
                        request.remote,
                        request.session_id,
                        format!("connect timed out after {:?}", timeout),
                    );
                    return;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("[{}] Failed to set TCP_NODELAY: {}", request.remote, e);
            }
            let (reader, mut writer) = stream.into_split();

            let handshake = match ClusterEnvelope::connect(&request.local, request.session_id)
                .and_then(|envelope| envelope.encode())
            {
                Ok(frame) => frame,
                Err(e) => {
                    bridge.on_connect_failed(request.remote, request.session_id, e.to_string());
                    return;
                }
            };
            if let Err(e) = write_frame(&mut writer, &handshake).await {
                bridge.on_connect_failed(request.remote, request.session_id, e.to_string());
                return;
            }

            run_connection(reader, writer, request.remote, request.session_id, true, bridge);
        });
    }
}

/// Accepts inbound sessions
pub struct TcpSessionListener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl TcpSessionListener {
    /// Bind `address` and accept sessions on the `io` pool, reporting them
    /// to `bridge`
    pub fn bind(address: &PeerAddress, bridge: SessionBridge, io: &DispatchPool) -> ClusterResult<Self> {
        let listener = std::net::TcpListener::bind(address.socket_addr_string())?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        info!("Listening for cluster sessions on {}", local_addr);
        io.spawn(accept_loop(listener, bridge, shutdown_rx));
        Ok(TcpSessionListener {
            local_addr,
            shutdown,
        })
    }

    /// Bound socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting; live sessions are unaffected
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for TcpSessionListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: std::net::TcpListener,
    bridge: SessionBridge,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to register cluster listener: {}", e);
            return;
        }
    };
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted cluster connection from {}", peer);
                    tokio::spawn(accept_connection(stream, bridge.clone()));
                }
                Err(e) => warn!("Failed to accept cluster connection: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Cluster listener stopped");
}

async fn accept_connection(stream: TcpStream, bridge: SessionBridge) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let (mut reader, writer) = stream.into_split();
    let frame = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader)).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            debug!("Connection closed before handshake");
            return;
        }
        Ok(Err(e)) => {
            warn!("Failed to read handshake: {}", e);
            return;
        }
        Err(_) => {
            warn!("Handshake timed out after {:?}", HANDSHAKE_TIMEOUT);
            return;
        }
    };
    let request = match ClusterEnvelope::decode(&frame).and_then(|envelope| envelope.connect_request()) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting connection with bad handshake: {}", e);
            return;
        }
    };
    run_connection(reader, writer, request.sender, request.session_id, false, bridge);
}

/// Ensures a connection reports its end exactly once
#[derive(Default)]
struct EndLatch(AtomicBool);

impl EndLatch {
    fn trip(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

fn run_connection(
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    remote: PeerAddress,
    session_id: Uuid,
    outbound: bool,
    bridge: SessionBridge,
) {
    let (handle, commands) = SessionHandle::new(session_id, outbound);
    let latch = Arc::new(EndLatch::default());
    let reader_task = tokio::spawn(read_loop(
        reader,
        remote.clone(),
        handle.clone(),
        bridge.clone(),
        latch.clone(),
    ));
    tokio::spawn(write_loop(
        writer,
        commands,
        remote.clone(),
        handle.clone(),
        bridge.clone(),
        latch,
        reader_task,
    ));
    bridge.on_connected(remote, handle);
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    remote: PeerAddress,
    handle: SessionHandle,
    bridge: SessionBridge,
    latch: Arc<EndLatch>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => bridge.on_frame(remote.clone(), handle.session_id(), frame),
            Ok(None) => {
                if latch.trip() {
                    bridge.on_disconnected(remote, &handle);
                }
                break;
            }
            Err(e) => {
                if latch.trip() {
                    bridge.on_error(remote, &handle, e.to_string());
                }
                break;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    remote: PeerAddress,
    handle: SessionHandle,
    bridge: SessionBridge,
    latch: Arc<EndLatch>,
    reader_task: JoinHandle<()>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            SessionCommand::Send(envelope) => {
                let frame = match envelope.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("[{}][{}] Dropping unencodable envelope: {}", remote, handle.session_id(), e);
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    if latch.trip() {
                        bridge.on_error(remote.clone(), &handle, e.to_string());
                    }
                    break;
                }
            }
            SessionCommand::Close => {
                debug!("[{}][{}] Closing connection", remote, handle.session_id());
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    reader_task.abort();
    if latch.trip() {
        bridge.on_disconnected(remote, &handle);
    }
}

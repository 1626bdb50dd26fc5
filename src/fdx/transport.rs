//! FDX socket transport.
//!
//! One type covers both variants; the kind is chosen from [`FdxConfig`]:
//!
//! - **UDP**: unconnected socket bound to the local address, frames go to the
//!   configured target, every datagram is one frame.
//! - **TCP**: client socket connected once to the target. The stream is cut
//!   back into frames with the header length field.
//!
//! Inbound frames are checked for the signature and handed to
//! [`session::handle_datagram`] on a background receive task.

use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::codec;
use super::protocol::{TransportKind, FDX_SIGNATURE, HEADER_SIZE};
use super::session::{self, FdxCommandHandler};
use crate::config::FdxConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::logging::CallbackLogger;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest UDP payload.
const DATAGRAM_BUFFER_SIZE: usize = 65_536;

/// Frame and byte counters for one FDX transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdxTransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Inbound data without a valid signature or header.
    pub frames_dropped: u64,
    /// Send failures and frames whose commands failed to decode.
    pub errors: u64,
}

#[derive(Default)]
struct StatsCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_dropped: AtomicU64,
    errors: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> FdxTransportStats {
        FdxTransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

struct TcpLink {
    local_addr: SocketAddr,
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
}

#[derive(Clone)]
enum FdxSocket {
    Udp(Arc<UdpSocket>),
    Tcp(Arc<TcpLink>),
}

/// State the receive task shares with its transport.
#[derive(Clone)]
struct ReceiveContext {
    running: Arc<AtomicBool>,
    link_up: Arc<AtomicBool>,
    stats: Arc<StatsCounters>,
    logger: CallbackLogger,
    receive_timeout: Duration,
}

impl ReceiveContext {
    async fn deliver(&self, handler: &dyn FdxCommandHandler, frame: Bytes, peer: Option<SocketAddr>) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        if !codec::has_signature(&frame) {
            warn!("Dropping {} bytes without FDX signature from {:?}", frame.len(), peer);
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.logger.log_fdx_frame("RX", &frame);

        match session::handle_datagram(handler, frame, peer).await {
            Ok(count) => debug!("Dispatched {} FDX commands", count),
            Err(e @ BridgeError::MalformedFrame { .. }) => {
                warn!("Dropping malformed FDX frame from {:?}: {}", peer, e);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("FDX frame from {:?} only partly decoded: {}", peer, e);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn receive_udp(self, socket: Arc<UdpSocket>, handler: Arc<dyn FdxCommandHandler>) {
        let mut buffer = vec![0u8; DATAGRAM_BUFFER_SIZE];

        while self.running.load(Ordering::SeqCst) {
            match timeout(self.receive_timeout, socket.recv_from(&mut buffer)).await {
                Err(_) => continue,
                Ok(Ok((len, peer))) => {
                    let frame = Bytes::copy_from_slice(&buffer[..len]);
                    self.deliver(handler.as_ref(), frame, Some(peer)).await;
                }
                // ICMP port unreachable from an earlier send
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    debug!("FDX peer unreachable: {}", e);
                }
                Ok(Err(e)) => {
                    error!("FDX UDP receive failed: {}", e);
                    self.link_up.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    async fn receive_tcp(self, link: Arc<TcpLink>, handler: Arc<dyn FdxCommandHandler>) {
        let mut buffer = BytesMut::with_capacity(8 * 1024);

        while self.running.load(Ordering::SeqCst) {
            let read = {
                let mut reader = link.reader.lock().await;
                timeout(self.receive_timeout, reader.read_buf(&mut buffer)).await
            };
            match read {
                Err(_) => continue,
                Ok(Ok(0)) => {
                    info!("FDX peer closed the TCP connection");
                    self.link_up.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(Ok(_)) => {
                    while let Some(frame) = next_stream_frame(&mut buffer, &self.stats) {
                        self.deliver(handler.as_ref(), frame, None).await;
                    }
                }
                Ok(Err(e)) => {
                    error!("FDX TCP receive failed: {}", e);
                    self.link_up.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }
}

/// Cut the next complete frame off a TCP receive buffer.
///
/// Leading bytes that do not start a frame are discarded up to the next
/// signature. Returns `None` until a whole frame is buffered.
fn next_stream_frame(buffer: &mut BytesMut, stats: &StatsCounters) -> Option<Bytes> {
    loop {
        if !codec::has_signature(&buffer[..]) {
            let skip = match buffer
                .windows(FDX_SIGNATURE.len())
                .position(|window| window == FDX_SIGNATURE)
            {
                Some(position) => position,
                None if buffer.len() < FDX_SIGNATURE.len() && FDX_SIGNATURE.starts_with(&buffer[..]) => return None,
                None => buffer.len().saturating_sub(FDX_SIGNATURE.len() - 1),
            };
            if skip == 0 {
                return None;
            }
            warn!("Discarding {} bytes of unframed FDX stream data", skip);
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            buffer.advance(skip);
            continue;
        }

        let length = codec::peek_frame_length(&buffer[..])?;
        if length < HEADER_SIZE {
            warn!("FDX stream frame declares length {}, resynchronising", length);
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            buffer.advance(FDX_SIGNATURE.len());
            continue;
        }
        if buffer.len() < length {
            return None;
        }
        return Some(buffer.split_to(length).freeze());
    }
}

/// UDP or TCP socket carrying FDX frames.
pub struct FdxTransport {
    kind: TransportKind,
    local_addr: SocketAddr,
    target_addr: SocketAddr,
    receive_timeout: Duration,
    socket: RwLock<Option<FdxSocket>>,
    running: Arc<AtomicBool>,
    link_up: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<StatsCounters>,
    logger: CallbackLogger,
}

impl FdxTransport {
    pub fn new(config: &FdxConfig) -> Self {
        Self {
            kind: config.transport,
            local_addr: config.local_addr(),
            target_addr: config.target_addr(),
            receive_timeout: config.receive_timeout(),
            socket: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            link_up: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
            stats: Arc::new(StatsCounters::default()),
            logger: CallbackLogger::disabled(),
        }
    }

    /// Log every frame sent and received through `logger`.
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn target_addr(&self) -> SocketAddr {
        self.target_addr
    }

    /// Bind (UDP) or connect (TCP). Failures are reported as `Connection`.
    pub async fn open(&self) -> BridgeResult<()> {
        if self.is_open() {
            return Ok(());
        }

        let socket = match self.kind {
            TransportKind::Udp => {
                let socket = UdpSocket::bind(self.local_addr).await.map_err(|e| {
                    BridgeError::connection(format!("Cannot bind FDX UDP socket to {}: {}", self.local_addr, e))
                })?;
                info!(
                    "FDX UDP socket bound to {}, target {}",
                    socket.local_addr().unwrap_or(self.local_addr),
                    self.target_addr
                );
                FdxSocket::Udp(Arc::new(socket))
            }
            TransportKind::Tcp => FdxSocket::Tcp(Arc::new(self.connect_tcp().await?)),
        };

        self.store_socket(Some(socket))?;
        self.link_up.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn connect_tcp(&self) -> BridgeResult<TcpLink> {
        let connection_error =
            |e: std::io::Error| BridgeError::connection(format!("FDX TCP connection to {} failed: {}", self.target_addr, e));

        let socket = if self.target_addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(connection_error)?;

        if self.local_addr.port() != 0 {
            socket.set_reuseaddr(true).map_err(connection_error)?;
            socket.bind(self.local_addr).map_err(connection_error)?;
        }

        let stream = timeout(CONNECT_TIMEOUT, socket.connect(self.target_addr))
            .await
            .map_err(|_| {
                BridgeError::connection(format!("FDX TCP connection to {} timed out", self.target_addr))
            })?
            .map_err(connection_error)?;
        stream.set_nodelay(true).map_err(connection_error)?;

        let local_addr = stream.local_addr().map_err(connection_error)?;
        info!("FDX TCP connected {} -> {}", local_addr, self.target_addr);

        let (reader, writer) = stream.into_split();
        Ok(TcpLink {
            local_addr,
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
        })
    }

    fn store_socket(&self, socket: Option<FdxSocket>) -> BridgeResult<Option<FdxSocket>> {
        let mut slot = self
            .socket
            .write()
            .map_err(|_| BridgeError::internal("FDX socket lock poisoned"))?;
        Ok(std::mem::replace(&mut *slot, socket))
    }

    fn current_socket(&self) -> BridgeResult<FdxSocket> {
        self.socket
            .read()
            .map_err(|_| BridgeError::internal("FDX socket lock poisoned"))?
            .clone()
            .ok_or_else(|| BridgeError::not_connected("FDX transport not open"))
    }

    /// Open and not torn down by a receive failure.
    pub fn is_open(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
            && self.socket.read().map(|socket| socket.is_some()).unwrap_or(false)
    }

    pub fn local_addr(&self) -> BridgeResult<SocketAddr> {
        match self.current_socket()? {
            FdxSocket::Udp(socket) => Ok(socket.local_addr()?),
            FdxSocket::Tcp(link) => Ok(link.local_addr),
        }
    }

    /// Send one complete frame.
    pub async fn send(&self, frame: &[u8]) -> BridgeResult<()> {
        let result = match self.current_socket()? {
            FdxSocket::Udp(socket) => match socket.send_to(frame, self.target_addr).await {
                Ok(sent) if sent == frame.len() => Ok(()),
                Ok(sent) => Err(BridgeError::io(format!(
                    "FDX datagram truncated: {} of {} bytes sent",
                    sent,
                    frame.len()
                ))),
                Err(e) => Err(BridgeError::io(format!("FDX send to {} failed: {}", self.target_addr, e))),
            },
            FdxSocket::Tcp(link) => {
                let mut writer = link.writer.lock().await;
                writer
                    .write_all(frame)
                    .await
                    .map_err(|e| BridgeError::io(format!("FDX send to {} failed: {}", self.target_addr, e)))
            }
        };

        match result {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_sent
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                self.logger.log_fdx_frame("TX", frame);
                Ok(())
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Spawn the receive task, dispatching every inbound frame to `handler`.
    pub fn start_receiving(&self, handler: Arc<dyn FdxCommandHandler>) -> BridgeResult<()> {
        let socket = self.current_socket()?;
        let mut receiver = self
            .receiver
            .lock()
            .map_err(|_| BridgeError::internal("FDX receiver lock poisoned"))?;
        if receiver.as_ref().map_or(false, |task| !task.is_finished()) {
            return Err(BridgeError::protocol_usage("FDX receive loop already running"));
        }

        self.running.store(true, Ordering::SeqCst);
        let context = ReceiveContext {
            running: self.running.clone(),
            link_up: self.link_up.clone(),
            stats: self.stats.clone(),
            logger: self.logger.clone(),
            receive_timeout: self.receive_timeout,
        };

        let task = match socket {
            FdxSocket::Udp(socket) => tokio::spawn(context.receive_udp(socket, handler)),
            FdxSocket::Tcp(link) => tokio::spawn(context.receive_tcp(link, handler)),
        };
        *receiver = Some(task);
        debug!("FDX receive loop started");
        Ok(())
    }

    /// Stop the receive task, waiting at most one receive timeout for it.
    pub async fn stop_receiving(&self) {
        self.running.store(false, Ordering::SeqCst);
        let task = self.receiver.lock().ok().and_then(|mut receiver| receiver.take());
        if let Some(mut task) = task {
            let grace = self.receive_timeout + Duration::from_millis(500);
            if timeout(grace, &mut task).await.is_err() {
                warn!("FDX receive loop did not stop in time, aborting");
                task.abort();
            }
            debug!("FDX receive loop stopped");
        }
    }

    /// Stop receiving and release the socket; TCP shuts its write side down first.
    pub async fn close(&self) -> BridgeResult<()> {
        self.stop_receiving().await;
        self.link_up.store(false, Ordering::SeqCst);

        if let Some(socket) = self.store_socket(None)? {
            if let FdxSocket::Tcp(link) = socket {
                let mut writer = link.writer.lock().await;
                if let Err(e) = writer.shutdown().await {
                    debug!("FDX TCP shutdown: {}", e);
                }
            }
            info!("FDX transport closed");
        }
        Ok(())
    }

    pub fn get_stats(&self) -> FdxTransportStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdx::protocol::{FdxByteOrder, FdxCommandCode, FdxVersion};
    use crate::fdx::session::{CommandContext, FdxSession};
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<(FdxCommandCode, Option<SocketAddr>)>);

    #[async_trait]
    impl FdxCommandHandler for Forward {
        async fn on_start(&self, ctx: &CommandContext) {
            let _ = self.0.send((FdxCommandCode::Start, ctx.peer));
        }

        async fn on_stop(&self, ctx: &CommandContext) {
            let _ = self.0.send((FdxCommandCode::Stop, ctx.peer));
        }
    }

    fn loopback_config(kind: TransportKind, target_port: u16) -> FdxConfig {
        FdxConfig {
            transport: kind,
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: 0,
            target_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            target_port,
            receive_timeout_ms: 100,
            ..FdxConfig::default()
        }
    }

    fn start_stop_frame(kind: TransportKind) -> Bytes {
        let mut session = FdxSession::new(kind, FdxVersion::default(), FdxByteOrder::Big);
        session.start(false).unwrap();
        session.stop(true).unwrap();
        session.take_frame().unwrap()
    }

    #[tokio::test]
    async fn test_udp_send_and_receive() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = FdxTransport::new(&loopback_config(TransportKind::Udp, peer.local_addr().unwrap().port()));
        transport.open().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start_receiving(Arc::new(Forward(tx))).unwrap();

        let frame = start_stop_frame(TransportKind::Udp);
        transport.send(&frame).await.unwrap();
        let mut buffer = [0u8; 64];
        let (len, from) = peer.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..len], &frame[..]);
        assert_eq!(from, transport.local_addr().unwrap());

        peer.send_to(b"garbage!garbage!", from).await.unwrap();
        peer.send_to(&frame, from).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        assert_eq!(rx.recv().await, Some((FdxCommandCode::Start, Some(peer_addr))));
        assert_eq!(rx.recv().await, Some((FdxCommandCode::Stop, Some(peer_addr))));

        transport.close().await.unwrap();
        let stats = transport.get_stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.frames_dropped, 1);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_tcp_reassembles_split_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = FdxTransport::new(&loopback_config(TransportKind::Tcp, listener.local_addr().unwrap().port()));

        let (opened, accepted) = tokio::join!(transport.open(), listener.accept());
        opened.unwrap();
        let (mut server, _) = accepted.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start_receiving(Arc::new(Forward(tx))).unwrap();

        let frame = start_stop_frame(TransportKind::Tcp);
        server.write_all(&frame[..10]).await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(&frame[10..]).await.unwrap();

        assert_eq!(rx.recv().await, Some((FdxCommandCode::Start, None)));
        assert_eq!(rx.recv().await, Some((FdxCommandCode::Stop, None)));

        transport.send(&frame).await.unwrap();
        let mut echoed = vec![0u8; frame.len()];
        server.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, frame.to_vec());

        transport.close().await.unwrap();
        let mut rest = Vec::new();
        assert_eq!(server.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tcp_connect_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = FdxTransport::new(&loopback_config(TransportKind::Tcp, port));
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection { .. }));
        assert!(!transport.is_open());
        assert!(transport.send(&[0u8; 16]).await.is_err());
    }

    #[test]
    fn test_stream_resynchronises_on_signature() {
        let stats = StatsCounters::default();
        let frame = start_stop_frame(TransportKind::Tcp);

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(b"\x00\x01junk");
        buffer.extend_from_slice(&frame);
        buffer.extend_from_slice(&frame[..5]);

        assert_eq!(next_stream_frame(&mut buffer, &stats), Some(frame.clone()));
        assert_eq!(next_stream_frame(&mut buffer, &stats), None);
        assert_eq!(&buffer[..], &frame[..5]);
        assert_eq!(stats.snapshot().frames_dropped, 1);
    }
}

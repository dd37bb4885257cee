// Jackson Coxson

//! TCP-like stream multiplexing over the device's bulk USB pipe.
//!
//! One transport owns the pipe. A single reader task drains bulk-in and
//! dispatches payload into per-connection receive buffers; writers share a
//! transport-level lock so every packet reaches the wire whole. Each
//! [`MuxConnection`] implements `AsyncRead`/`AsyncWrite`, which is what lets
//! the TLS session and the plist framing stack on top unchanged.

pub mod packet;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll, Waker};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::{BulkIn, BulkOut, DeviceError};
use packet::{MuxHeader, MuxPacket};

/// First source port handed out by a fresh transport.
const FIRST_SOURCE_PORT: u16 = 0x1234;
/// How long to wait for the device's SYN+ACK.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Grace period for the peer's FIN after ours goes out.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);
/// Largest payload placed in one packet, keeping the total length within
/// what the 16-bit length field can mirror.
const MAX_PAYLOAD: usize = 0xffff - packet::HEADER_SIZE;

/// Lifecycle of a logical connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    HalfClosed,
    Closed,
}

struct ConnInner {
    state: ConnectionState,
    rx: BytesMut,
    read_waker: Option<Waker>,
    /// Payload bytes sent to the device.
    seq: u32,
    /// Payload bytes accepted from the device.
    ack: u32,
    /// Send budget left from the window the device last advertised.
    peer_window: u32,
    /// The peer sent FIN; reads drain `rx` and then report end of stream.
    peer_fin: bool,
    /// Failure that killed the connection, surfaced by reads and writes.
    error: Option<String>,
    syn_reply: Option<oneshot::Sender<Result<(), DeviceError>>>,
}

struct ConnShared {
    source_port: u16,
    dest_port: u16,
    inner: Mutex<ConnInner>,
    /// Signalled on every inbound packet and on close, so senders waiting
    /// for window and closers waiting for the peer's FIN wake up.
    activity: Notify,
}

impl ConnShared {
    fn fail(&self, reason: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            fail_locked(&mut inner, reason);
        }
        self.activity.notify_waiters();
    }
}

/// Marks a connection dead while its lock is held.
fn fail_locked(inner: &mut ConnInner, reason: &str) {
    inner.state = ConnectionState::Closed;
    if inner.error.is_none() {
        inner.error = Some(reason.to_string());
    }
    if let Some(tx) = inner.syn_reply.take() {
        let _ = tx.send(Err(DeviceError::MuxError(reason.to_string())));
    }
    if let Some(waker) = inner.read_waker.take() {
        waker.wake();
    }
}

struct TransportShared {
    /// Bulk-out half. Held across one whole packet write, never longer.
    output: AsyncMutex<Box<dyn BulkOut>>,
    /// Registry of live connections keyed by local source port. The
    /// connections hold the strong handle to this shared state, not the
    /// other way around, so ownership never cycles.
    connections: Mutex<HashMap<u16, Arc<ConnShared>>>,
    next_source_port: Mutex<u16>,
    shutdown: Notify,
}

/// Multiplexes logical connections over one bulk pipe.
pub struct MuxTransport {
    shared: Arc<TransportShared>,
    reader: Option<JoinHandle<()>>,
}

impl fmt::Debug for MuxTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxTransport")
            .field(
                "connections",
                &self.shared.connections.lock().unwrap().len(),
            )
            .finish()
    }
}

impl MuxTransport {
    /// Starts a transport over a bulk-endpoint backend that has already
    /// completed the version handshake.
    ///
    /// `UsbDevice::open` calls this with the USB endpoints; it is public so
    /// alternate backends can be plugged in.
    pub fn start(input: Box<dyn BulkIn>, output: Box<dyn BulkOut>) -> Self {
        let shared = Arc::new(TransportShared {
            output: AsyncMutex::new(output),
            connections: Mutex::new(HashMap::new()),
            next_source_port: Mutex::new(FIRST_SOURCE_PORT),
            shutdown: Notify::new(),
        });
        let reader = tokio::spawn(reader_loop(shared.clone(), input));
        Self {
            shared,
            reader: Some(reader),
        }
    }

    /// Opens a logical connection to `dest_port` on the device.
    ///
    /// Sends SYN and waits up to one second for the device's SYN+ACK.
    pub async fn connect(&self, dest_port: u16) -> Result<MuxConnection, DeviceError> {
        if dest_port == 0 {
            return Err(DeviceError::InvalidArg);
        }
        let source_port = {
            let mut next = self.shared.next_source_port.lock().unwrap();
            let port = *next;
            *next = next.wrapping_add(1);
            port
        };
        let (tx, rx) = oneshot::channel();
        let conn = Arc::new(ConnShared {
            source_port,
            dest_port,
            inner: Mutex::new(ConnInner {
                state: ConnectionState::Connecting,
                rx: BytesMut::new(),
                read_waker: None,
                seq: 0,
                ack: 0,
                peer_window: packet::WINDOW_SIZE as u32,
                peer_fin: false,
                error: None,
                syn_reply: Some(tx),
            }),
            activity: Notify::new(),
        });
        self.shared
            .connections
            .lock()
            .unwrap()
            .insert(source_port, conn.clone());

        debug!("connecting {source_port} -> {dest_port}");
        let syn = MuxPacket {
            source_port,
            dest_port,
            seq: 0,
            ack: 0,
            flags: packet::FLAG_SYN,
            window: packet::WINDOW_SIZE,
            payload: &[],
        };
        if let Err(e) = send_packet(&self.shared, &syn).await {
            self.shared.connections.lock().unwrap().remove(&source_port);
            return Err(e.into());
        }

        match tokio::time::timeout(CONNECT_TIMEOUT, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                self.shared.connections.lock().unwrap().remove(&source_port);
                return Err(DeviceError::MuxError(
                    "transport closed during connect".to_string(),
                ));
            }
            Err(_) => {
                self.shared.connections.lock().unwrap().remove(&source_port);
                return Err(DeviceError::Timeout);
            }
        }

        Ok(MuxConnection {
            shared: self.shared.clone(),
            conn,
            write_fut: None,
            shutdown_fut: None,
        })
    }

    /// Forcibly resets every live connection, then stops the reader task,
    /// which drains residual bulk-in data before exiting.
    pub async fn shutdown(&mut self) {
        let conns: Vec<Arc<ConnShared>> = self
            .shared
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in conns {
            let counters = {
                let mut inner = conn.inner.lock().unwrap();
                if inner.state == ConnectionState::Closed {
                    None
                } else {
                    let counters = (inner.seq, inner.ack);
                    fail_locked(&mut inner, "device closed");
                    Some(counters)
                }
            };
            conn.activity.notify_waiters();
            if let Some((seq, ack)) = counters {
                let rst = MuxPacket {
                    source_port: conn.source_port,
                    dest_port: conn.dest_port,
                    seq,
                    ack,
                    flags: packet::FLAG_RST,
                    window: 0,
                    payload: &[],
                };
                if let Err(e) = send_packet(&self.shared, &rst).await {
                    debug!("reset during shutdown failed: {e}");
                }
            }
        }
        self.shared.shutdown.notify_one();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }
}

impl Drop for MuxTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Writes one packet to the wire while holding the transport's out-lock, so
/// no other sender can interleave bytes into it.
async fn send_packet(shared: &TransportShared, pkt: &MuxPacket<'_>) -> io::Result<()> {
    let encoded = pkt.encode();
    trace!(
        "mux send: {} -> {} seq={} ack={} flags={:#04x} len={}",
        pkt.source_port,
        pkt.dest_port,
        pkt.seq,
        pkt.ack,
        pkt.flags,
        encoded.len()
    );
    let mut output = shared.output.lock().await;
    output.write_all(&encoded).await?;
    output.flush().await?;
    Ok(())
}

/// Sends caller payload, chunked to the packet cap and the window the
/// device advertises. Blocks while the window is shut.
async fn send_data(
    shared: Arc<TransportShared>,
    conn: Arc<ConnShared>,
    data: Bytes,
) -> io::Result<usize> {
    let mut sent = 0;
    while sent < data.len() {
        let (seq, ack, chunk) = loop {
            // register for the wakeup before checking, or a notify landing
            // between the check and the await is lost
            let mut activity = std::pin::pin!(conn.activity.notified());
            activity.as_mut().enable();
            {
                let inner = conn.inner.lock().unwrap();
                if let Some(e) = &inner.error {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, e.clone()));
                }
                if inner.state != ConnectionState::Open {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "connection is not open",
                    ));
                }
                let window = inner.peer_window as usize;
                if window > 0 {
                    break (
                        inner.seq,
                        inner.ack,
                        window.min(MAX_PAYLOAD).min(data.len() - sent),
                    );
                }
            }
            trace!("send window shut on port {}, waiting", conn.source_port);
            activity.await;
        };

        let pkt = MuxPacket {
            source_port: conn.source_port,
            dest_port: conn.dest_port,
            seq,
            ack,
            flags: packet::FLAG_ACK,
            window: packet::WINDOW_SIZE,
            payload: &data[sent..sent + chunk],
        };
        if let Err(e) = send_packet(&shared, &pkt).await {
            conn.fail(&format!("bulk write failed: {e}"));
            return Err(e);
        }
        {
            let mut inner = conn.inner.lock().unwrap();
            inner.seq = inner.seq.wrapping_add(chunk as u32);
            inner.peer_window = inner.peer_window.saturating_sub(chunk as u32);
        }
        sent += chunk;
    }
    Ok(data.len())
}

/// FIN-closes a connection: HalfClosed, then Closed once the peer answers
/// with its FIN or the grace period runs out.
async fn graceful_close(shared: Arc<TransportShared>, conn: Arc<ConnShared>) -> io::Result<()> {
    let counters = {
        let mut inner = conn.inner.lock().unwrap();
        match inner.state {
            ConnectionState::Closed | ConnectionState::HalfClosed => None,
            _ => {
                inner.state = ConnectionState::HalfClosed;
                Some((inner.seq, inner.ack))
            }
        }
    };
    if let Some((seq, ack)) = counters {
        let fin = MuxPacket {
            source_port: conn.source_port,
            dest_port: conn.dest_port,
            seq,
            ack,
            flags: packet::FLAG_FIN | packet::FLAG_ACK,
            window: packet::WINDOW_SIZE,
            payload: &[],
        };
        if let Err(e) = send_packet(&shared, &fin).await {
            debug!("fin write failed: {e}");
        } else {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
                loop {
                    let mut activity = std::pin::pin!(conn.activity.notified());
                    activity.as_mut().enable();
                    {
                        let inner = conn.inner.lock().unwrap();
                        if inner.peer_fin || inner.state == ConnectionState::Closed {
                            break;
                        }
                    }
                    activity.await;
                }
            })
            .await;
        }
    }
    {
        let mut inner = conn.inner.lock().unwrap();
        inner.state = ConnectionState::Closed;
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
    }
    conn.activity.notify_waiters();
    shared.connections.lock().unwrap().remove(&conn.source_port);
    debug!("connection {} -> {} closed", conn.source_port, conn.dest_port);
    Ok(())
}

async fn read_mux_packet(
    input: &mut Box<dyn BulkIn>,
) -> Result<(MuxHeader, BytesMut), DeviceError> {
    let mut header = [0u8; packet::HEADER_SIZE];
    input.read_exact(&mut header).await?;
    let header = MuxHeader::parse(&header)?;
    let mut payload = BytesMut::zeroed(header.payload_len());
    if !payload.is_empty() {
        input.read_exact(&mut payload).await?;
    }
    Ok((header, payload))
}

/// The dedicated reader. Owns bulk-in for the transport's whole life.
async fn reader_loop(shared: Arc<TransportShared>, mut input: Box<dyn BulkIn>) {
    loop {
        let result = tokio::select! {
            biased;
            _ = shared.shutdown.notified() => {
                crate::usb::drain(&mut input).await;
                return;
            }
            result = read_mux_packet(&mut input) => result,
        };
        let (header, payload) = match result {
            Ok(packet) => packet,
            Err(e) => {
                debug!("mux reader stopping: {e}");
                fail_all(&shared, &format!("transport failed: {e}"));
                return;
            }
        };
        if header.protocol != packet::PROTOCOL_TCP {
            warn!("dropping mux packet with protocol {}", header.protocol);
            continue;
        }
        dispatch(&shared, header, payload).await;
    }
}

/// Routes one inbound packet into its connection's receive buffer and emits
/// the flow-control ACK.
async fn dispatch(shared: &Arc<TransportShared>, header: MuxHeader, payload: BytesMut) {
    trace!(
        "mux recv: {} -> {} seq={} ack={} flags={:#04x} len={}",
        header.source_port,
        header.dest_port,
        header.seq,
        header.ack,
        header.flags,
        header.length
    );
    let conn = shared
        .connections
        .lock()
        .unwrap()
        .get(&header.dest_port)
        .cloned();
    let Some(conn) = conn else {
        debug!("dropping packet for unknown local port {}", header.dest_port);
        return;
    };
    if conn.dest_port != header.source_port {
        debug!(
            "dropping packet from device port {} (expected {})",
            header.source_port, conn.dest_port
        );
        return;
    }

    let mut ack_update = None;
    let mut remove = false;
    {
        let mut inner = conn.inner.lock().unwrap();
        inner.peer_window = header.window as u32;

        if inner.state == ConnectionState::Connecting {
            if header.flags & packet::FLAG_RST != 0 {
                fail_locked(&mut inner, "connection refused");
                remove = true;
            } else if header.flags & (packet::FLAG_SYN | packet::FLAG_ACK)
                == packet::FLAG_SYN | packet::FLAG_ACK
            {
                inner.state = ConnectionState::Open;
                if let Some(tx) = inner.syn_reply.take() {
                    let _ = tx.send(Ok(()));
                }
            } else {
                warn!(
                    "unexpected flags {:#04x} while connecting port {}",
                    header.flags, conn.source_port
                );
            }
        } else if header.flags & packet::FLAG_RST != 0 {
            fail_locked(&mut inner, "connection reset by device");
            remove = true;
        } else {
            if !payload.is_empty() {
                if header.seq != inner.ack {
                    let acked = inner.ack;
                    fail_locked(
                        &mut inner,
                        &format!(
                            "out-of-order packet: seq {} but {} bytes acked",
                            header.seq, acked
                        ),
                    );
                    remove = true;
                } else {
                    inner.rx.extend_from_slice(&payload);
                    inner.ack = inner.ack.wrapping_add(payload.len() as u32);
                    if let Some(waker) = inner.read_waker.take() {
                        waker.wake();
                    }
                    ack_update = Some((inner.seq, inner.ack));
                }
            }
            if header.flags & packet::FLAG_FIN != 0 {
                inner.peer_fin = true;
                if inner.state == ConnectionState::HalfClosed {
                    inner.state = ConnectionState::Closed;
                }
                if let Some(waker) = inner.read_waker.take() {
                    waker.wake();
                }
            }
        }
    }
    conn.activity.notify_waiters();

    if remove {
        shared
            .connections
            .lock()
            .unwrap()
            .remove(&conn.source_port);
    }
    if let Some((seq, ack)) = ack_update {
        let pkt = MuxPacket {
            source_port: conn.source_port,
            dest_port: conn.dest_port,
            seq,
            ack,
            flags: packet::FLAG_ACK,
            window: packet::WINDOW_SIZE,
            payload: &[],
        };
        if let Err(e) = send_packet(shared, &pkt).await {
            conn.fail(&format!("ack write failed: {e}"));
        }
    }
}

fn fail_all(shared: &TransportShared, reason: &str) {
    let conns: Vec<Arc<ConnShared>> = shared
        .connections
        .lock()
        .unwrap()
        .drain()
        .map(|(_, conn)| conn)
        .collect();
    for conn in conns {
        conn.fail(reason);
    }
}

type BoxedIoFuture<T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send>>;

/// One logical TCP-like stream to the device.
///
/// Reads resolve as soon as the reader task buffers payload for this
/// connection; `Ok(0)` means the peer closed. Writes go out as one or more
/// whole packets. Dropping the connection abandons it locally; use
/// [`MuxConnection::disconnect`] for the FIN exchange or
/// [`MuxConnection::reset`] to abort.
pub struct MuxConnection {
    shared: Arc<TransportShared>,
    conn: Arc<ConnShared>,
    write_fut: Option<BoxedIoFuture<usize>>,
    shutdown_fut: Option<BoxedIoFuture<()>>,
}

impl fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxConnection")
            .field("source_port", &self.conn.source_port)
            .field("dest_port", &self.conn.dest_port)
            .field("state", &self.state())
            .finish()
    }
}

impl MuxConnection {
    pub fn source_port(&self) -> u16 {
        self.conn.source_port
    }

    pub fn dest_port(&self) -> u16 {
        self.conn.dest_port
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.inner.lock().unwrap().state
    }

    /// Sends all of `data`, blocking while the device's window is shut.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.write_all(data).await?;
        Ok(())
    }

    /// Receives whatever payload is buffered, waiting if there is none yet.
    /// Returns `Ok(0)` once the peer has closed.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        Ok(self.read(buf).await?)
    }

    /// Like [`MuxConnection::recv`] with a deadline. A timeout leaves the
    /// connection usable; a zero timeout polls the buffer without waiting.
    pub async fn recv_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, DeviceError> {
        match tokio::time::timeout(timeout, self.read(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeviceError::Timeout),
        }
    }

    /// FIN-closes the connection and waits briefly for the peer's FIN.
    pub async fn disconnect(mut self) -> Result<(), DeviceError> {
        self.shutdown().await?;
        Ok(())
    }

    /// Aborts the connection with RST. The device discards any state
    /// immediately.
    pub async fn reset(self) -> Result<(), DeviceError> {
        let counters = {
            let mut inner = self.conn.inner.lock().unwrap();
            if inner.state == ConnectionState::Closed {
                None
            } else {
                inner.state = ConnectionState::Closed;
                if let Some(waker) = inner.read_waker.take() {
                    waker.wake();
                }
                Some((inner.seq, inner.ack))
            }
        };
        self.conn.activity.notify_waiters();
        self.shared
            .connections
            .lock()
            .unwrap()
            .remove(&self.conn.source_port);
        if let Some((seq, ack)) = counters {
            let rst = MuxPacket {
                source_port: self.conn.source_port,
                dest_port: self.conn.dest_port,
                seq,
                ack,
                flags: packet::FLAG_RST,
                window: 0,
                payload: &[],
            };
            send_packet(&self.shared, &rst).await?;
        }
        Ok(())
    }
}

impl AsyncRead for MuxConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = this.conn.inner.lock().unwrap();
        if !inner.rx.is_empty() {
            let n = inner.rx.len().min(buf.remaining());
            let chunk = inner.rx.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        if let Some(e) = &inner.error {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                e.clone(),
            )));
        }
        if inner.peer_fin || inner.state == ConnectionState::Closed {
            return Poll::Ready(Ok(()));
        }
        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MuxConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_fut.is_none() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            this.write_fut = Some(Box::pin(send_data(
                this.shared.clone(),
                this.conn.clone(),
                Bytes::copy_from_slice(buf),
            )));
        }
        let result = ready!(this.write_fut.as_mut().unwrap().as_mut().poll(cx));
        this.write_fut = None;
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(fut) = this.write_fut.as_mut() {
            let result = ready!(fut.as_mut().poll(cx));
            this.write_fut = None;
            result?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(fut) = this.write_fut.as_mut() {
            let result = ready!(fut.as_mut().poll(cx));
            this.write_fut = None;
            result?;
        }
        if this.shutdown_fut.is_none() {
            this.shutdown_fut = Some(Box::pin(graceful_close(
                this.shared.clone(),
                this.conn.clone(),
            )));
        }
        let result = ready!(this.shutdown_fut.as_mut().unwrap().as_mut().poll(cx));
        this.shutdown_fut = None;
        Poll::Ready(result)
    }
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        {
            let mut inner = self.conn.inner.lock().unwrap();
            if inner.state != ConnectionState::Closed {
                inner.state = ConnectionState::Closed;
                if let Some(waker) = inner.read_waker.take() {
                    waker.wake();
                }
            }
        }
        self.conn.activity.notify_waiters();
        self.shared
            .connections
            .lock()
            .unwrap()
            .remove(&self.conn.source_port);
    }
}

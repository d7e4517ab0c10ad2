//! TCP bridge client.
//!
//! The board exposes its AXI interconnect through a TCP bridge speaking a
//! simple framed protocol: fixed 8-byte header (kind, flag, sequence,
//! payload length) followed by the payload. Requests are answered in order;
//! interrupt frames arrive unsolicited at any time and are routed to the
//! interrupt path instead of the request/response path.
//!
//! A connection is owned by an actor task; [`TcpAxi`] handles are cheap
//! clones that submit requests over a channel and await the response. One
//! request is in flight at a time, which matches the bridge's in-order
//! execution and keeps register sequences strictly ordered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, trace, warn};

use super::{Axi, AxiError, AxiResult, InterruptWait};

/// Request frame kinds.
mod kind {
    pub const READ32: u8 = 0x01;
    pub const WRITE32: u8 = 0x02;
    pub const BULK_WRITE: u8 = 0x03;
    pub const CDMA_COPY: u8 = 0x04;
    pub const CDMA_WRITE: u8 = 0x05;
    pub const IRQ_ENABLE: u8 = 0x06;
    /// Device → host: response to the request with the same sequence.
    pub const RESPONSE: u8 = 0x81;
    /// Device → host: unsolicited interrupt notification.
    pub const INTERRUPT: u8 = 0x82;
}

/// WRITE32 flag: wait for AXI completion before acknowledging.
const FLAG_CONFIRMED: u8 = 0x01;
/// BULK_WRITE flag: swap byte order per 32-bit word on the device.
const FLAG_BYTESWAP: u8 = 0x02;

/// Largest payload the codec will accept on receive. Bulk uploads stay far
/// below this; anything bigger is a corrupt header.
const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024 + 32;

/// CDMA requests above this size are split into sequential copies so a
/// single frame never describes gigabytes of work the bridge would time out
/// on. Callers still observe one logical operation.
const CDMA_CHUNK: u64 = 256 * 1024 * 1024;

/// Chunk size for `cdma_write` payload frames.
const CDMA_WRITE_CHUNK: usize = 1024 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// One wire frame in either direction.
#[derive(Debug, Clone)]
struct Frame {
    kind: u8,
    flag: u8,
    seq: u16,
    payload: Bytes,
}

struct BridgeCodec;

impl Encoder<Frame> for BridgeCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(8 + frame.payload.len());
        dst.put_u8(frame.kind);
        dst.put_u8(frame.flag);
        dst.put_u16(frame.seq);
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for BridgeCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < 8 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame payload length {len} exceeds limit"),
            ));
        }
        if src.len() < 8 + len {
            src.reserve(8 + len - src.len());
            return Ok(None);
        }
        let kind = src.get_u8();
        let flag = src.get_u8();
        let seq = src.get_u16();
        src.advance(4); // length, already parsed
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame {
            kind,
            flag,
            seq,
            payload,
        }))
    }
}

/// An interrupt notification delivered by the bridge.
#[derive(Debug, Clone, Copy)]
struct Interrupt {
    mask: u32,
    data: u64,
}

struct Request {
    frame: Frame,
    /// None for posted writes: the actor sends and moves on.
    respond: Option<oneshot::Sender<AxiResult<Frame>>>,
    timeout: Duration,
}

struct Shared {
    req_tx: mpsc::Sender<Request>,
    /// Single-consumer interrupt queue. The search loop is the only waiter,
    /// so an async mutex around the receiver suffices; interrupts that fire
    /// between waits stay buffered.
    irq_rx: tokio::sync::Mutex<mpsc::Receiver<Interrupt>>,
    kick: Notify,
    timeout_ms: AtomicU64,
    seq: AtomicU64,
}

/// Handle onto one bridge connection.
#[derive(Clone)]
pub struct TcpAxi {
    shared: Arc<Shared>,
}

impl TcpAxi {
    /// Connect to a bridge at `host:port`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> AxiResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| AxiError::Timeout)??;
        stream.set_nodelay(true)?;
        debug!(host, port, "bridge connected");

        let (req_tx, req_rx) = mpsc::channel(16);
        let (irq_tx, irq_rx) = mpsc::channel(64);
        tokio::spawn(connection_actor(Framed::new(stream, BridgeCodec), req_rx, irq_tx));

        Ok(Self {
            shared: Arc::new(Shared {
                req_tx,
                irq_rx: tokio::sync::Mutex::new(irq_rx),
                kick: Notify::new(),
                timeout_ms: AtomicU64::new(DEFAULT_TIMEOUT.as_millis() as u64),
                seq: AtomicU64::new(1),
            }),
        })
    }

    fn next_seq(&self) -> u16 {
        self.shared.seq.fetch_add(1, Ordering::Relaxed) as u16
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.shared.timeout_ms.load(Ordering::Relaxed))
    }

    /// Submit a request and await its response frame.
    async fn roundtrip(&self, kind: u8, flag: u8, payload: Bytes) -> AxiResult<Frame> {
        let (tx, rx) = oneshot::channel();
        let req = Request {
            frame: Frame {
                kind,
                flag,
                seq: self.next_seq(),
                payload,
            },
            respond: Some(tx),
            timeout: self.timeout(),
        };
        self.shared
            .req_tx
            .send(req)
            .await
            .map_err(|_| AxiError::Closed)?;
        rx.await.map_err(|_| AxiError::Closed)?
    }

    /// Submit a posted request: queued in order, no acknowledgement.
    async fn post(&self, kind: u8, flag: u8, payload: Bytes) -> AxiResult<()> {
        let req = Request {
            frame: Frame {
                kind,
                flag,
                seq: self.next_seq(),
                payload,
            },
            respond: None,
            timeout: self.timeout(),
        };
        self.shared
            .req_tx
            .send(req)
            .await
            .map_err(|_| AxiError::Closed)
    }
}

fn check_status(frame: &Frame) -> AxiResult<()> {
    if frame.flag == 0 {
        Ok(())
    } else {
        Err(AxiError::Device(frame.flag))
    }
}

#[async_trait]
impl Axi for TcpAxi {
    async fn read(&self, addr: u32) -> AxiResult<u32> {
        let mut p = BytesMut::with_capacity(4);
        p.put_u32(addr);
        let resp = self.roundtrip(kind::READ32, 0, p.freeze()).await?;
        check_status(&resp)?;
        if resp.payload.len() < 4 {
            return Err(AxiError::Protocol("short read response".into()));
        }
        let mut payload = resp.payload.clone();
        Ok(payload.get_u32())
    }

    async fn write(&self, value: u32, addr: u32, confirmed: bool) -> AxiResult<()> {
        let mut p = BytesMut::with_capacity(8);
        p.put_u32(addr);
        p.put_u32(value);
        if confirmed {
            let resp = self
                .roundtrip(kind::WRITE32, FLAG_CONFIRMED, p.freeze())
                .await?;
            check_status(&resp)
        } else {
            self.post(kind::WRITE32, 0, p.freeze()).await
        }
    }

    async fn write_bulk(&self, data: &[u8], addr: u32, swap: bool) -> AxiResult<()> {
        let mut p = BytesMut::with_capacity(4 + data.len());
        p.put_u32(addr);
        p.extend_from_slice(data);
        let flag = if swap { FLAG_BYTESWAP } else { 0 };
        let resp = self.roundtrip(kind::BULK_WRITE, flag, p.freeze()).await?;
        check_status(&resp)
    }

    async fn cdma_copy(&self, src: u64, dst: u64, len: u64) -> AxiResult<()> {
        let mut offset = 0u64;
        while offset < len {
            let chunk = (len - offset).min(CDMA_CHUNK);
            let mut p = BytesMut::with_capacity(24);
            p.put_u64(src + offset);
            p.put_u64(dst + offset);
            p.put_u64(chunk);
            let resp = self.roundtrip(kind::CDMA_COPY, 0, p.freeze()).await?;
            check_status(&resp)?;
            offset += chunk;
        }
        Ok(())
    }

    async fn cdma_write(&self, data: &[u8], addr: u64) -> AxiResult<()> {
        for (i, chunk) in data.chunks(CDMA_WRITE_CHUNK).enumerate() {
            let mut p = BytesMut::with_capacity(8 + chunk.len());
            p.put_u64(addr + (i * CDMA_WRITE_CHUNK) as u64);
            p.extend_from_slice(chunk);
            let resp = self.roundtrip(kind::CDMA_WRITE, 0, p.freeze()).await?;
            check_status(&resp)?;
        }
        Ok(())
    }

    async fn enable_interrupts(&self, mask: u32) -> AxiResult<()> {
        let mut p = BytesMut::with_capacity(4);
        p.put_u32(mask);
        let resp = self.roundtrip(kind::IRQ_ENABLE, 0, p.freeze()).await?;
        check_status(&resp)
    }

    async fn wait_for_interrupt(&self, mask: u32, timeout: Duration) -> AxiResult<InterruptWait> {
        let mut rx = self.shared.irq_rx.lock().await;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::select! {
                irq = rx.recv() => match irq {
                    Some(irq) if irq.mask & mask != 0 => {
                        return Ok(InterruptWait::Data(irq.data));
                    }
                    Some(other) => {
                        trace!(mask = other.mask, "dropping interrupt outside wait mask");
                    }
                    None => return Err(AxiError::Closed),
                },
                _ = self.shared.kick.notified() => return Ok(InterruptWait::TimedOut),
                _ = tokio::time::sleep_until(deadline) => return Ok(InterruptWait::TimedOut),
            }
        }
    }

    fn kick_interrupts(&self) {
        self.shared.kick.notify_waiters();
    }

    fn set_timeout(&self, timeout: Duration) {
        self.shared
            .timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }
}

/// Socket-owning actor: serializes requests, routes responses back to their
/// callers, and forwards interrupt frames to the interrupt queue.
async fn connection_actor(
    mut framed: Framed<TcpStream, BridgeCodec>,
    mut req_rx: mpsc::Receiver<Request>,
    irq_tx: mpsc::Sender<Interrupt>,
) {
    loop {
        tokio::select! {
            req = req_rx.recv() => {
                let Some(req) = req else { break };
                if let Err(fatal) = handle_request(&mut framed, req, &irq_tx).await {
                    warn!(error = %fatal, "bridge connection failed");
                    break;
                }
            }

            frame = framed.next() => {
                match frame {
                    Some(Ok(frame)) => route_unsolicited(frame, &irq_tx),
                    Some(Err(e)) => {
                        warn!(error = %e, "bridge stream error");
                        break;
                    }
                    None => {
                        debug!("bridge closed connection");
                        break;
                    }
                }
            }
        }
    }
    // Dropping req_rx/irq_tx errors out all held handles.
}

fn route_unsolicited(frame: Frame, irq_tx: &mpsc::Sender<Interrupt>) {
    if frame.kind != kind::INTERRUPT || frame.payload.len() < 12 {
        warn!(kind = frame.kind, "unexpected frame outside request window");
        return;
    }
    let mut p = frame.payload.clone();
    let irq = Interrupt {
        mask: p.get_u32(),
        data: p.get_u64(),
    };
    // If the queue is full the oldest data is stale anyway; drop the newest
    // rather than block the socket reader.
    if irq_tx.try_send(irq).is_err() {
        warn!("interrupt queue full, dropping notification");
    }
}

/// Send one request and, unless it is posted, pump the stream until its
/// response arrives or the per-request timeout expires. Interrupt frames
/// seen meanwhile are routed, not dropped.
async fn handle_request(
    framed: &mut Framed<TcpStream, BridgeCodec>,
    req: Request,
    irq_tx: &mpsc::Sender<Interrupt>,
) -> Result<(), std::io::Error> {
    let seq = req.frame.seq;
    if let Err(e) = framed.send(req.frame).await {
        if let Some(tx) = req.respond {
            let _ = tx.send(Err(AxiError::Io(std::io::Error::new(e.kind(), "send failed"))));
        }
        return Err(e);
    }
    let Some(respond) = req.respond else {
        return Ok(());
    };

    let deadline = tokio::time::Instant::now() + req.timeout;
    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = tokio::time::sleep_until(deadline) => {
                let _ = respond.send(Err(AxiError::Timeout));
                return Ok(());
            }
        };
        match frame {
            Some(Ok(frame)) if frame.kind == kind::RESPONSE && frame.seq == seq => {
                let _ = respond.send(Ok(frame));
                return Ok(());
            }
            Some(Ok(frame)) if frame.kind == kind::RESPONSE => {
                // Response to an earlier request that already timed out.
                trace!(seq = frame.seq, "dropping stale response");
            }
            Some(Ok(frame)) => route_unsolicited(frame, irq_tx),
            Some(Err(e)) => {
                let _ = respond.send(Err(AxiError::Io(std::io::Error::new(
                    e.kind(),
                    "receive failed",
                ))));
                return Err(e);
            }
            None => {
                let _ = respond.send(Err(AxiError::Closed));
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "bridge closed",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut BridgeCodec, buf: &mut BytesMut) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).expect("decode") {
            out.push(frame);
        }
        out
    }

    #[test]
    fn codec_roundtrips_header_and_payload() {
        let mut codec = BridgeCodec;
        let mut wire = BytesMut::new();

        let mut p = BytesMut::new();
        p.put_u32(0x5040);
        p.put_u32(0xDEAD_BEEF);
        codec
            .encode(
                Frame {
                    kind: kind::WRITE32,
                    flag: FLAG_CONFIRMED,
                    seq: 7,
                    payload: p.freeze(),
                },
                &mut wire,
            )
            .expect("encode");

        let frames = decode_all(&mut codec, &mut wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, kind::WRITE32);
        assert_eq!(frames[0].flag, FLAG_CONFIRMED);
        assert_eq!(frames[0].seq, 7);
        assert_eq!(frames[0].payload.len(), 8);
        assert!(wire.is_empty());
    }

    #[test]
    fn codec_waits_for_full_frame() {
        let mut codec = BridgeCodec;
        let mut wire = BytesMut::new();
        codec
            .encode(
                Frame {
                    kind: kind::INTERRUPT,
                    flag: 0,
                    seq: 0,
                    payload: Bytes::from_static(&[0u8; 12]),
                },
                &mut wire,
            )
            .expect("encode");

        // Feed one byte short of the full frame: nothing decodes yet.
        let mut partial = wire.split_to(wire.len() - 1);
        assert!(codec.decode(&mut partial).expect("decode").is_none());
        partial.unsplit(wire);
        assert!(codec.decode(&mut partial).expect("decode").is_some());
    }

    #[test]
    fn codec_rejects_absurd_length() {
        let mut codec = BridgeCodec;
        let mut wire = BytesMut::new();
        wire.put_u8(kind::RESPONSE);
        wire.put_u8(0);
        wire.put_u16(1);
        wire.put_u32(u32::MAX);
        assert!(codec.decode(&mut wire).is_err());
    }
}

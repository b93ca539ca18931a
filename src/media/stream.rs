//! Per-leg audio plumbing.
//!
//! Each call leg gets one writer task that drains a queue of outbound
//! packets through the leg's [`SequenceMerger`] and writes to the leg's
//! transport (UDP towards the SIP peer, the live-call handle towards the
//! camera). Producers hold a cloneable [`AudioSink`] and never block: the
//! queue is bounded and full means drop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::rtp::RtpPacket;
use super::sequencer::{AudioSource, SequenceMerger};
use crate::camera::CameraCall;
use crate::config::MediaConfig;
use crate::error::Result;
use crate::net::bind_udp_socket;

/// Queue depth per leg writer. At 20 ms packetization this is several seconds
/// of audio, far beyond what a healthy consumer leaves queued.
const WRITER_QUEUE_DEPTH: usize = 256;

struct OutboundAudio {
    packet: RtpPacket,
    source: AudioSource,
}

/// Cloneable handle used to forward outbound audio into a leg.
#[derive(Clone)]
pub struct AudioSink {
    tx: mpsc::Sender<OutboundAudio>,
    label: &'static str,
}

impl AudioSink {
    pub fn forward(&self, packet: RtpPacket, source: AudioSource) {
        if let Err(err) = self.tx.try_send(OutboundAudio { packet, source }) {
            tracing::trace!(leg = self.label, error = %err, "dropping outbound audio");
        }
    }
}

/// A running leg writer: the sink producers write into plus its teardown
/// handle. Closing is idempotent.
pub struct LegWriter {
    sink: AudioSink,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl LegWriter {
    pub fn sink(&self) -> AudioSink {
        self.sink.clone()
    }

    pub fn close(&self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

/// Spawn the SIP leg writer: merge sequencing, relabel the payload type to
/// the negotiated one, send on the shared RTP socket.
pub fn spawn_sip_writer(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    payload_type: u8,
) -> LegWriter {
    let (tx, mut rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let mut merger = SequenceMerger::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                queued = rx.recv() => {
                    let Some(OutboundAudio { mut packet, source }) = queued else {
                        break;
                    };
                    if !merger.process(&mut packet, source) {
                        continue;
                    }
                    packet.header.payload_type = payload_type;
                    if let Err(err) = socket.send_to(&packet.to_bytes(), remote).await {
                        tracing::debug!(%remote, error = %err, "failed to send RTP to SIP peer");
                    }
                }
            }
        }
        tracing::debug!(%remote, "sip leg writer stopped");
    });
    LegWriter {
        sink: AudioSink { tx, label: "sip" },
        shutdown,
        task,
    }
}

/// Spawn the camera leg writer: merge sequencing, then hand packets to the
/// live-call transport. Payload types pass through untouched.
pub fn spawn_camera_writer(call: Arc<dyn CameraCall>) -> LegWriter {
    let (tx, mut rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let mut merger = SequenceMerger::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                queued = rx.recv() => {
                    let Some(OutboundAudio { mut packet, source }) = queued else {
                        break;
                    };
                    if !merger.process(&mut packet, source) {
                        continue;
                    }
                    if let Err(err) = call.send_audio(packet).await {
                        tracing::debug!(error = %err, "failed to send audio to camera");
                    }
                }
            }
        }
        tracing::debug!("camera leg writer stopped");
    });
    LegWriter {
        sink: AudioSink { tx, label: "camera" },
        shutdown,
        task,
    }
}

struct ReceiveTask {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// The SIP leg's RTP socket.
///
/// Bound once at startup so its address can be advertised in every local
/// description; the receive loop is per call and forwards inbound packets
/// into the camera leg's sink.
pub struct RtpEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    receive: Mutex<Option<ReceiveTask>>,
}

impl RtpEndpoint {
    pub fn bind(config: &MediaConfig) -> Result<Self> {
        let socket = bind_udp_socket(&config.rtp, config.rtp.port)?;
        let local_addr = socket.local_addr()?;
        tracing::debug!(%local_addr, "rtp endpoint bound");
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            receive: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Start forwarding inbound packets into `sink` as speech, replacing any
    /// previous receive loop.
    pub async fn start_receiving(&self, sink: AudioSink) {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let socket = self.socket.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("rtp receive loop cancelled");
                        break;
                    }
                    result = socket.recv_from(&mut buf) => {
                        let (len, src) = match result {
                            Ok(res) => res,
                            Err(err) => {
                                tracing::warn!(error = %err, "rtp receive error");
                                continue;
                            }
                        };
                        match RtpPacket::parse(&buf[..len]) {
                            Ok(packet) => sink.forward(packet, AudioSource::Speech),
                            Err(err) => {
                                tracing::trace!(%src, error = %err, "ignoring non-RTP datagram");
                            }
                        }
                    }
                }
            }
        });

        let mut slot = self.receive.lock().await;
        if let Some(previous) = slot.replace(ReceiveTask { shutdown, task }) {
            previous.shutdown.cancel();
            previous.task.abort();
        }
    }

    /// Stop the per-call receive loop. Idempotent.
    pub async fn stop_receiving(&self) {
        if let Some(receive) = self.receive.lock().await.take() {
            receive.shutdown.cancel();
            receive.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BindConfig;
    use crate::media::RtpHeader;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCall {
        sent: AtomicUsize,
        stopped: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CameraCall for CountingCall {
        async fn activate_speaker(&self) -> Result<()> {
            Ok(())
        }

        async fn send_audio(&self, _packet: RtpPacket) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn packet(sequence: u16) -> RtpPacket {
        RtpPacket::new(RtpHeader::new(96, sequence, 0, 7), Bytes::new())
    }

    #[tokio::test]
    async fn camera_writer_drops_tones_after_speech() {
        let call = Arc::new(CountingCall {
            sent: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        });
        let writer = spawn_camera_writer(call.clone());
        let sink = writer.sink();

        sink.forward(packet(1), AudioSource::Speech);
        sink.forward(packet(2), AudioSource::Tone);
        sink.forward(packet(3), AudioSource::Speech);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(call.sent.load(Ordering::SeqCst), 2);
        writer.close();
    }

    #[tokio::test]
    async fn sip_writer_relabels_payload_type_and_sends() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = receiver.local_addr().unwrap();
        let sender = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let writer = spawn_sip_writer(sender, remote, 111);
        writer.sink().forward(packet(500), AudioSource::Speech);

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            receiver.recv_from(&mut buf),
        )
        .await
        .expect("packet within timeout")
        .unwrap();
        let forwarded = RtpPacket::parse(&buf[..len]).unwrap();
        assert_eq!(forwarded.header.payload_type, 111);
        // First speech packet starts the merged stream at zero.
        assert_eq!(forwarded.header.sequence, 0);
        writer.close();
    }

    #[tokio::test]
    async fn endpoint_receive_loop_feeds_sink_and_stops() {
        let endpoint = RtpEndpoint::bind(&MediaConfig {
            rtp: BindConfig {
                address: "127.0.0.1".parse().unwrap(),
                port: 0,
                interface: None,
            },
        })
        .unwrap();

        let call = Arc::new(CountingCall {
            sent: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        });
        let writer = spawn_camera_writer(call.clone());
        endpoint.start_receiving(writer.sink()).await;

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe
            .send_to(&packet(9).to_bytes(), endpoint.local_addr())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(call.sent.load(Ordering::SeqCst), 1);

        endpoint.stop_receiving().await;
        endpoint.stop_receiving().await; // second stop is a no-op
        writer.close();
    }
}

//! Ringback tone injection.
//!
//! While a call is half-established (exactly one leg ready for audio), an
//! external encoder plays ringback as OPUS RTP towards a loopback socket;
//! every received packet fans out into the eligible legs' sinks as tone
//! audio. The camera leg only hears ringback once the SIP remote is actually
//! ringing. As soon as both legs are ready the generator is stopped and live
//! audio takes over; the sequence mergers behind the sinks splice the two
//! phases into one stream.

use std::net::{IpAddr, Ipv4Addr};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BindConfig, ToneConfig};
use crate::error::Result;
use crate::media::{AudioSink, AudioSource, RtpPacket};
use crate::net::bind_udp_socket;

/// The two call legs tones can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneLeg {
    Sip,
    Camera,
}

#[derive(Default)]
struct ToneState {
    sip_sink: Option<AudioSink>,
    camera_sink: Option<AudioSink>,
    sip_ringing: bool,
    source: Option<ToneSource>,
}

struct ToneSource {
    child: Option<Child>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    port: u16,
}

/// Injects ringback into half-established calls. Reusable across calls; all
/// per-call resources are released by [`ToneInjector::clear`].
pub struct ToneInjector {
    config: ToneConfig,
    state: Arc<Mutex<ToneState>>,
}

impl ToneInjector {
    pub fn new(config: ToneConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ToneState::default())),
        }
    }

    /// Mark a leg ready for tone audio and hand over its sink. The first
    /// ready leg starts the generator; the second stops it.
    pub async fn leg_ready(&self, leg: ToneLeg, sink: AudioSink) -> Result<()> {
        let mut state = self.state.lock().await;
        match leg {
            ToneLeg::Sip => state.sip_sink = Some(sink),
            ToneLeg::Camera => state.camera_sink = Some(sink),
        }
        info!(?leg, "tone leg ready");
        self.manage_generator(&mut state).await
    }

    /// The SIP remote has started ringing; the camera leg may hear ringback
    /// from now on. Idempotent.
    pub async fn remote_ringing(&self) {
        self.state.lock().await.sip_ringing = true;
    }

    /// Stop the generator, release the socket, reset every flag and sink.
    /// Idempotent and callable from any state.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut source) = state.source.take() {
            source.shutdown.cancel();
            if let Some(mut child) = source.child.take() {
                if let Err(err) = child.kill().await {
                    debug!(error = %err, "tone generator already gone");
                }
            }
            source.task.abort();
            info!("tone injection stopped");
        }
        state.sip_sink = None;
        state.camera_sink = None;
        state.sip_ringing = false;
    }

    async fn manage_generator(&self, state: &mut ToneState) -> Result<()> {
        let both_ready = state.sip_sink.is_some() && state.camera_sink.is_some();
        if both_ready {
            if let Some(source) = state.source.as_mut()
                && let Some(mut child) = source.child.take()
            {
                info!("both legs ready, stopping tone generator");
                if let Err(err) = child.kill().await {
                    debug!(error = %err, "tone generator already gone");
                }
            }
            return Ok(());
        }

        if state.source.is_none() {
            state.source = Some(self.start_source().await?);
        }
        Ok(())
    }

    async fn start_source(&self) -> Result<ToneSource> {
        let bind = BindConfig {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            interface: None,
        };
        let socket = bind_udp_socket(&bind, 0)?;
        let port = socket.local_addr()?.port();

        let child = Command::new(&self.config.ffmpeg_bin)
            .args([
                "-hide_banner",
                "-protocol_whitelist",
                "file,udp,rtp,crypto",
                "-re",
                "-i",
            ])
            .arg(&self.config.ringback_path)
            .args([
                "-acodec", "libopus", "-ac", "2", "-ar", "48k", "-flags", "+global_header", "-f",
                "rtp",
            ])
            .arg(format!("rtp://127.0.0.1:{port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        info!(port, bin = %self.config.ffmpeg_bin, "tone generator started");

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let state = self.state.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = socket.recv_from(&mut buf) => {
                        let len = match result {
                            Ok((len, _)) => len,
                            Err(err) => {
                                warn!(error = %err, "tone socket receive error");
                                continue;
                            }
                        };
                        let Ok(packet) = RtpPacket::parse(&buf[..len]) else {
                            continue;
                        };
                        let state = state.lock().await;
                        if let Some(sink) = &state.sip_sink {
                            sink.forward(packet.clone(), AudioSource::Tone);
                        }
                        if state.sip_ringing
                            && let Some(sink) = &state.camera_sink
                        {
                            sink.forward(packet, AudioSource::Tone);
                        }
                    }
                }
            }
        });

        Ok(ToneSource {
            child: Some(child),
            shutdown,
            task,
            port,
        })
    }

    #[cfg(test)]
    async fn generator_running(&self) -> bool {
        self.state
            .lock()
            .await
            .source
            .as_ref()
            .is_some_and(|source| source.child.is_some())
    }

    #[cfg(test)]
    async fn port(&self) -> Option<u16> {
        self.state
            .lock()
            .await
            .source
            .as_ref()
            .map(|source| source.port)
    }
}

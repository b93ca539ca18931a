use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use doorbell_sip::DoorbellBridgeBuilder;
use doorbell_sip::camera::{CameraCall, CameraClient, CameraEvent, CameraHealth};
use doorbell_sip::config::{
    BindConfig, BridgeConfig, HealthConfig, MediaConfig, SipAuth, SipConfig, TimerConfig,
    ToneConfig, TransportProfile,
};
use doorbell_sip::media::RtpPacket;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "doorbell-sip-bridge",
    about = "Bridge a cloud doorbell camera onto a SIP extension",
    version
)]
struct Cli {
    /// IP address to bind for SIP signalling
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    sip_bind_addr: IpAddr,

    /// UDP port to bind for SIP signalling
    #[arg(long, default_value_t = 5060)]
    sip_bind_port: u16,

    /// Optional network interface name for SO_BINDTODEVICE on the SIP socket
    #[arg(long)]
    sip_interface: Option<String>,

    /// IP address of the SIP server (no DNS lookup)
    #[arg(long)]
    sip_server_ip: IpAddr,

    /// UDP port of the SIP server
    #[arg(long, default_value_t = 5060)]
    sip_server_port: u16,

    /// SIP domain used in the address-of-record and request URIs
    #[arg(long)]
    sip_domain: String,

    /// User part of the bridge's address-of-record
    #[arg(long)]
    sip_username: String,

    /// Extension dialled when the doorbell button is pressed
    #[arg(long)]
    sip_extension: String,

    /// Username for digest authentication against the SIP server
    #[arg(long)]
    sip_auth_username: Option<String>,

    /// Password for digest authentication against the SIP server
    #[arg(long)]
    sip_auth_password: Option<String>,

    /// RTP bind address (defaults to the SIP bind address)
    #[arg(long)]
    rtp_bind_addr: Option<IpAddr>,

    /// RTP bind port (0 for auto)
    #[arg(long, default_value_t = 0)]
    rtp_bind_port: u16,

    /// Optional interface for the RTP socket
    #[arg(long)]
    rtp_interface: Option<String>,

    /// Encoder binary used to generate ringback RTP
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg_bin: String,

    /// Audio file played as ringback while one call leg waits for the other
    #[arg(long)]
    ringback_path: PathBuf,

    /// Seconds between registration refreshes (also the requested Expires)
    #[arg(long, default_value_t = 600)]
    registration_refresh: u64,

    /// Seconds to wait for a final REGISTER response
    #[arg(long, default_value_t = 8)]
    register_timeout: u64,

    /// Seconds to wait for the phone to pick up before giving up
    #[arg(long, default_value_t = 60)]
    invite_timeout: u64,

    /// Bind address for the health endpoint
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    health_bind_addr: IpAddr,

    /// TCP port for GET /health; omitted disables the endpoint
    #[arg(long)]
    health_port: Option<u16>,

    /// Override for the User-Agent header on outbound SIP messages
    #[arg(long)]
    user_agent: Option<String>,

    /// Bind address for the UDP test camera
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    camera_udp_addr: IpAddr,

    /// UDP port the test camera listens on ("ring" datagram presses the button)
    #[arg(long, default_value_t = 15300)]
    camera_udp_port: u16,

    /// Log level (default info)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_bridge_config(self) -> Result<BridgeConfig> {
        let sip_bind = BindConfig {
            address: self.sip_bind_addr,
            port: self.sip_bind_port,
            interface: self.sip_interface,
        };

        let auth = match (self.sip_auth_username, self.sip_auth_password) {
            (Some(username), Some(password)) => Some(SipAuth { username, password }),
            (Option::None, Option::None) => None,
            _ => {
                return Err(anyhow!(
                    "both --sip-auth-username and --sip-auth-password must be provided"
                ));
            }
        };

        let rtp = BindConfig {
            address: self.rtp_bind_addr.unwrap_or(sip_bind.address),
            port: self.rtp_bind_port,
            interface: self.rtp_interface,
        };

        let health = self.health_port.map(|port| HealthConfig {
            bind: BindConfig {
                address: self.health_bind_addr,
                port,
                interface: None,
            },
        });

        Ok(BridgeConfig {
            sip: SipConfig {
                bind: sip_bind,
                server_addr: self.sip_server_ip,
                server_port: self.sip_server_port,
                domain: self.sip_domain,
                username: self.sip_username,
                extension: self.sip_extension,
                auth,
                transport: TransportProfile::Udp,
            },
            media: MediaConfig { rtp },
            tones: ToneConfig {
                ffmpeg_bin: self.ffmpeg_bin,
                ringback_path: self.ringback_path,
            },
            timers: TimerConfig {
                registration_refresh_secs: self.registration_refresh,
                register_timeout_secs: self.register_timeout,
                invite_timeout_secs: self.invite_timeout,
            },
            health,
            user_agent: self.user_agent,
        })
    }
}

/// Stand-in for a real camera client, driven over UDP.
///
/// Any datagram beginning with `ring` presses the doorbell button; RTP
/// datagrams become doorbell microphone audio. Audio for the doorbell
/// speaker is sent back to whoever spoke last.
struct UdpTestCamera {
    bind: SocketAddr,
    shared: Arc<TestCameraShared>,
}

struct TestCameraShared {
    events: Mutex<Option<mpsc::UnboundedSender<CameraEvent>>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    peer: Mutex<Option<SocketAddr>>,
}

impl UdpTestCamera {
    fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            shared: Arc::new(TestCameraShared {
                events: Mutex::new(None),
                socket: Mutex::new(None),
                peer: Mutex::new(None),
            }),
        }
    }
}

#[async_trait::async_trait]
impl CameraClient for UdpTestCamera {
    async fn initialize(
        &self,
        events: mpsc::UnboundedSender<CameraEvent>,
    ) -> doorbell_sip::Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.bind).await?);
        info!(address = %socket.local_addr()?, "test camera listening");

        let _ = events.send(CameraEvent::HealthUpdate(CameraHealth {
            battery_percent: Some(100.0),
            connected: true,
        }));

        self.shared.events.lock().await.replace(events.clone());
        self.shared.socket.lock().await.replace(socket.clone());

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(error = %err, "test camera socket error");
                        break;
                    }
                };

                if buf[..len].starts_with(b"ring") {
                    info!(%src, "test camera button pressed");
                    shared.peer.lock().await.replace(src);
                    let _ = events.send(CameraEvent::ButtonPressed);
                    continue;
                }

                match RtpPacket::parse(&buf[..len]) {
                    Ok(packet) => {
                        shared.peer.lock().await.replace(src);
                        let _ = events.send(CameraEvent::AudioReceived(packet));
                    }
                    Err(err) => debug!(%src, error = %err, "ignoring datagram"),
                }
            }
        });

        Ok(())
    }

    async fn start_call(&self) -> doorbell_sip::Result<Arc<dyn CameraCall>> {
        let socket = self
            .shared
            .socket
            .lock()
            .await
            .clone()
            .ok_or_else(|| doorbell_sip::Error::camera("test camera not initialized"))?;

        // The test camera has no vendor session to negotiate; it answers
        // as soon as the call starts.
        if let Some(events) = self.shared.events.lock().await.as_ref() {
            let _ = events.send(CameraEvent::CallAnswered);
        }

        Ok(Arc::new(UdpTestCall {
            socket,
            shared: self.shared.clone(),
        }))
    }
}

struct UdpTestCall {
    socket: Arc<UdpSocket>,
    shared: Arc<TestCameraShared>,
}

#[async_trait::async_trait]
impl CameraCall for UdpTestCall {
    async fn activate_speaker(&self) -> doorbell_sip::Result<()> {
        info!("test camera speaker activated");
        Ok(())
    }

    async fn send_audio(&self, packet: RtpPacket) -> doorbell_sip::Result<()> {
        let Some(peer) = *self.shared.peer.lock().await else {
            return Ok(());
        };
        self.socket.send_to(&packet.to_bytes(), peer).await?;
        Ok(())
    }

    async fn stop(&self) -> doorbell_sip::Result<()> {
        debug!("test camera call stopped");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let camera_bind = SocketAddr::new(cli.camera_udp_addr, cli.camera_udp_port);
    let config = cli.into_bridge_config().context("build bridge config")?;

    info!("starting doorbell-sip bridge");

    let runtime = DoorbellBridgeBuilder::new(config, UdpTestCamera::new(camera_bind))
        .build()
        .context("initialise bridge runtime")?;

    let handle = runtime.start();

    info!("bridge started; press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;

    info!("shutdown signal received, stopping bridge");
    handle.shutdown().await.context("bridge shutdown")?;

    info!("bridge stopped");
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = if let Ok(value) = std::env::var(EnvFilter::DEFAULT_ENV) {
        EnvFilter::new(value)
    } else {
        EnvFilter::new(level)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
    Ok(())
}

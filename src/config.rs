use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct BindConfig {
    pub address: IpAddr,
    pub port: u16,
    /// Interface to pin the socket to with SO_BINDTODEVICE (Linux only).
    pub interface: Option<String>,
}

impl BindConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct SipConfig {
    pub bind: BindConfig,
    /// IP address of the SIP server the bridge registers through. This can differ
    /// from the SIP domain when DNS for the server is unavailable on the LAN.
    pub server_addr: IpAddr,
    /// UDP port used when connecting to the SIP server.
    pub server_port: u16,
    pub domain: String,
    /// User part of the bridge's own address-of-record.
    pub username: String,
    /// Extension dialled when the doorbell button is pressed.
    pub extension: String,
    pub auth: Option<SipAuth>,
    pub transport: TransportProfile,
}

impl SipConfig {
    pub fn server_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_addr, self.server_port)
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct SipAuth {
    pub username: String,
    pub password: String,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Local RTP endpoint advertised in SDP offers and answers.
    pub rtp: BindConfig,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct ToneConfig {
    /// Encoder binary spawned to generate ringback RTP.
    pub ffmpeg_bin: String,
    /// Audio file played as ringback while exactly one call leg is ready.
    pub ringback_path: PathBuf,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProfile {
    Udp,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Fixed re-REGISTER cadence, also used as the requested Expires value.
    pub registration_refresh_secs: u64,
    /// Upper bound on waiting for a final REGISTER response.
    pub register_timeout_secs: u64,
    pub invite_timeout_secs: u64,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub bind: BindConfig,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub sip: SipConfig,
    pub media: MediaConfig,
    pub tones: ToneConfig,
    pub timers: TimerConfig,
    /// Liveness probe listener; disabled when absent.
    pub health: Option<HealthConfig>,
    /// Optional User-Agent header override applied to all outbound SIP messages.
    pub user_agent: Option<String>,
}

impl BridgeConfig {
    pub fn resolved_user_agent(&self) -> String {
        match self.user_agent.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => DEFAULT_USER_AGENT.to_string(),
        }
    }
}

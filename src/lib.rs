//! SIP bridge for cloud doorbell cameras.
//! This crate exposes a high-level builder that wires an ftth-rsipstack
//! endpoint, RTP forwarding, and ringback tone injection around a pluggable
//! camera client: a doorbell button press rings a SIP phone, and a call to
//! the bridge answers the doorbell.

mod net;

pub mod bridge;
pub mod camera;
pub mod config;
pub mod error;
pub mod health;
pub mod media;
pub mod sdp;
pub mod sip;
pub mod tones;

pub use bridge::{BridgeHandle, BridgeRuntime, DoorbellBridgeBuilder};
pub use config::BridgeConfig;
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::camera::{CameraCall, CameraClient, CameraEvent};
    use super::config::{
        BindConfig, BridgeConfig, MediaConfig, SipConfig, TimerConfig, ToneConfig,
        TransportProfile,
    };
    use super::error::{Error, Result};
    use super::DoorbellBridgeBuilder;

    /// Camera stand-in for lifecycle tests: initializes fine, never rings.
    struct IdleCamera;

    #[async_trait::async_trait]
    impl CameraClient for IdleCamera {
        async fn initialize(&self, _events: mpsc::UnboundedSender<CameraEvent>) -> Result<()> {
            Ok(())
        }

        async fn start_call(&self) -> Result<Arc<dyn CameraCall>> {
            Err(Error::camera("idle test camera cannot start calls"))
        }
    }

    #[tokio::test]
    async fn build_start_and_shut_down_bridge() {
        let config = BridgeConfig {
            sip: SipConfig {
                bind: BindConfig {
                    address: "127.0.0.1".parse().unwrap(),
                    port: 0,
                    interface: None,
                },
                server_addr: "127.0.0.1".parse().unwrap(),
                server_port: 5060,
                domain: "doorbell.example.net".into(),
                username: "doorbell".into(),
                extension: "100".into(),
                auth: None,
                transport: TransportProfile::Udp,
            },
            media: MediaConfig {
                rtp: BindConfig {
                    address: "127.0.0.1".parse().unwrap(),
                    port: 0,
                    interface: None,
                },
            },
            tones: ToneConfig {
                ffmpeg_bin: "true".into(),
                ringback_path: "/dev/null".into(),
            },
            timers: TimerConfig {
                registration_refresh_secs: 600,
                register_timeout_secs: 1,
                invite_timeout_secs: 4,
            },
            health: None,
            user_agent: None,
        };

        let runtime = DoorbellBridgeBuilder::new(config, IdleCamera)
            .build()
            .expect("build runtime");

        // We only test that the runtime can be started and shut down cleanly.
        let handle = runtime.start();
        handle.shutdown().await.expect("shutdown bridge");
    }
}

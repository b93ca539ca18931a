//! Capability surface of the cloud doorbell camera.
//!
//! The vendor's client library is not part of this crate; the bridge consumes
//! it through these traits. Implementations own their credentials, session
//! refresh, and device discovery, and feed every device- and call-scoped
//! event through the sender handed to [`CameraClient::initialize`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::RtpPacket;

/// Last reported device vitals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CameraHealth {
    pub battery_percent: Option<f32>,
    pub connected: bool,
}

/// Events surfaced by the camera collaborator.
#[derive(Debug)]
pub enum CameraEvent {
    /// Someone pressed the doorbell button.
    ButtonPressed,
    /// The live call was answered by the device.
    CallAnswered,
    /// The live call ended on the camera side.
    CallEnded,
    /// One RTP packet of doorbell microphone audio.
    AudioReceived(RtpPacket),
    /// Periodic device health report.
    HealthUpdate(CameraHealth),
}

/// Client side of the vendor's call/session surface.
#[async_trait]
pub trait CameraClient: Send + Sync + 'static {
    /// Connect to the vendor service and select the device. Device events
    /// (button presses, health) flow through `events` from now on.
    async fn initialize(&self, events: mpsc::UnboundedSender<CameraEvent>) -> Result<()>;

    /// Begin a live call with the device. Call-scoped events (answered,
    /// ended, audio) are reported through the sender given to `initialize`.
    async fn start_call(&self) -> Result<Arc<dyn CameraCall>>;
}

/// An active live call towards the doorbell.
#[async_trait]
pub trait CameraCall: Send + Sync {
    /// Unmute the doorbell's loudspeaker so forwarded audio is audible.
    async fn activate_speaker(&self) -> Result<()>;

    /// Send one RTP packet towards the doorbell speaker.
    async fn send_audio(&self, packet: RtpPacket) -> Result<()>;

    /// Tear the live call down. Safe to call more than once.
    async fn stop(&self) -> Result<()>;
}

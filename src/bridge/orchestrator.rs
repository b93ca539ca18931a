//! The event loop that ties the SIP leg, the camera leg, and the tone
//! generator into one call at a time.
//!
//! Both legs report through channels; the orchestrator owns every per-call
//! resource and funnels all failure paths into a single idempotent teardown,
//! so a torn-down call can always be followed by a fresh one.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::camera::{CameraClient, CameraEvent};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::health::{BridgePhase, HealthState};
use crate::media::{AudioSource, LegWriter, RtpEndpoint, spawn_camera_writer, spawn_sip_writer};
use crate::sip::{SipAgent, SipEvent};
use crate::tones::{ToneInjector, ToneLeg};

use super::builder::ShutdownSignal;

/// Long-lived collaborators, fixed for the lifetime of one `run`.
struct Wiring {
    agent: SipAgent,
    tones: ToneInjector,
    rtp: RtpEndpoint,
}

/// Everything held on behalf of the call in progress.
#[derive(Default)]
struct ActiveCall {
    camera_call: Option<Arc<dyn crate::camera::CameraCall>>,
    sip_writer: Option<LegWriter>,
    camera_writer: Option<LegWriter>,
    camera_tone_ready: bool,
}

pub(super) struct Orchestrator<C: CameraClient> {
    config: Arc<BridgeConfig>,
    camera: Arc<C>,
    health: HealthState,
}

impl<C> Orchestrator<C>
where
    C: CameraClient,
{
    pub(super) fn new(config: Arc<BridgeConfig>, camera: Arc<C>, health: HealthState) -> Self {
        Self {
            config,
            camera,
            health,
        }
    }

    pub(super) async fn run(&self, shutdown: &mut ShutdownSignal) -> Result<()> {
        let rtp = RtpEndpoint::bind(&self.config.media)?;

        let (sip_tx, mut sip_rx) = mpsc::unbounded_channel();
        let agent = SipAgent::new(&self.config, rtp.local_addr(), sip_tx);
        agent.initialize().await?;

        let (camera_tx, mut camera_rx) = mpsc::unbounded_channel();
        self.camera.initialize(camera_tx).await?;

        let auxiliary = CancellationToken::new();
        self.spawn_health_listener(&auxiliary);

        let agent_shutdown = CancellationToken::new();
        let agent_task = {
            let agent = agent.clone();
            let token = agent_shutdown.clone();
            tokio::spawn(async move { agent.run(token).await })
        };

        let wiring = Wiring {
            agent,
            tones: ToneInjector::new(self.config.tones.clone()),
            rtp,
        };
        let mut call = ActiveCall::default();

        self.health.set_phase(BridgePhase::Ok).await;
        info!("bridge running");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("shutdown requested");
                    break;
                }
                maybe_event = sip_rx.recv() => {
                    let Some(event) = maybe_event else {
                        warn!("SIP event channel closed");
                        break;
                    };
                    self.on_sip_event(&wiring, &mut call, event).await;
                }
                maybe_event = camera_rx.recv() => {
                    let Some(event) = maybe_event else {
                        warn!("camera event channel closed");
                        break;
                    };
                    self.on_camera_event(&wiring, &mut call, event).await;
                }
            }
        }

        self.health.set_phase(BridgePhase::ShuttingDown).await;
        self.teardown_call(&wiring, &mut call).await;

        // The serve loop outlives the agent's run loop, so the final
        // un-REGISTER can still see its response.
        agent_shutdown.cancel();
        match agent_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "SIP agent exited with error"),
            Err(join_err) => error!(error = %join_err, "SIP agent task panicked"),
        }
        wiring.agent.unregister().await;
        wiring.agent.shutdown().await;

        auxiliary.cancel();
        info!("bridge stopped");
        Ok(())
    }

    #[cfg(feature = "health")]
    fn spawn_health_listener(&self, auxiliary: &CancellationToken) {
        let Some(health_config) = self.config.health.as_ref() else {
            return;
        };
        let addr = health_config.bind.socket_addr();
        let state = self.health.clone();
        let token = auxiliary.child_token();
        tokio::spawn(async move {
            if let Err(err) = crate::health::serve_health(addr, state, token).await {
                error!(error = %err, "health endpoint failed");
            }
        });
    }

    #[cfg(not(feature = "health"))]
    fn spawn_health_listener(&self, _auxiliary: &CancellationToken) {
        if self.config.health.is_some() {
            warn!("health endpoint configured but compiled out");
        }
    }

    async fn on_sip_event(&self, wiring: &Wiring, call: &mut ActiveCall, event: SipEvent) {
        match event {
            SipEvent::RegistrationChanged { registered } => {
                info!(registered, "SIP registration changed");
            }
            SipEvent::RemoteRinging => {
                wiring.tones.remote_ringing().await;
            }
            SipEvent::InboundCall => {
                info!("inbound SIP call, starting camera live call");
                self.start_camera_call(wiring, call).await;
            }
            SipEvent::CallEstablished(media) => {
                info!(
                    destination = %media.socket_addr(),
                    payload_type = media.payload_type,
                    "SIP call established"
                );
                let writer =
                    spawn_sip_writer(wiring.rtp.socket(), media.socket_addr(), media.payload_type);
                if let Err(err) = wiring.tones.leg_ready(ToneLeg::Sip, writer.sink()).await {
                    warn!(error = %err, "failed to start ringback playback");
                }
                if let Some(previous) = call.sip_writer.replace(writer) {
                    previous.close();
                }
            }
            SipEvent::CallFailed { status, reason } => {
                warn!(status = ?status, reason, "SIP call failed");
                self.teardown_call(wiring, call).await;
            }
            SipEvent::CallEnded => {
                info!("SIP call ended");
                self.teardown_call(wiring, call).await;
            }
        }
    }

    async fn on_camera_event(&self, wiring: &Wiring, call: &mut ActiveCall, event: CameraEvent) {
        match event {
            CameraEvent::ButtonPressed => {
                if call.camera_call.is_some() {
                    debug!("button press ignored, call already in progress");
                    return;
                }
                info!("doorbell button pressed, bridging to SIP");
                let (placed, live) =
                    tokio::join!(wiring.agent.place_call(), self.camera.start_call());
                match (placed, live) {
                    (Ok(()), Ok(live)) => {
                        call.camera_call = Some(live);
                    }
                    (placed, live) => {
                        if let Err(err) = &placed {
                            warn!(error = %err, "failed to place SIP call");
                        }
                        match live {
                            Ok(live) => {
                                call.camera_call = Some(live);
                            }
                            Err(err) => warn!(error = %err, "failed to start camera call"),
                        }
                        self.teardown_call(wiring, call).await;
                    }
                }
            }
            CameraEvent::CallAnswered => {
                let Some(live) = call.camera_call.clone() else {
                    debug!("camera answered with no active call");
                    return;
                };
                info!("camera call answered");
                if let Err(err) = live.activate_speaker().await {
                    warn!(error = %err, "failed to activate camera speaker");
                }
                let writer = spawn_camera_writer(live);
                wiring.rtp.start_receiving(writer.sink()).await;
                if let Some(previous) = call.camera_writer.replace(writer) {
                    previous.close();
                }
            }
            CameraEvent::AudioReceived(packet) => {
                if !call.camera_tone_ready
                    && let Some(writer) = call.camera_writer.as_ref()
                {
                    call.camera_tone_ready = true;
                    if let Err(err) = wiring.tones.leg_ready(ToneLeg::Camera, writer.sink()).await {
                        warn!(error = %err, "failed to mark camera leg tone-ready");
                    }
                }
                if let Some(writer) = call.sip_writer.as_ref() {
                    writer.sink().forward(packet, AudioSource::Speech);
                }
            }
            CameraEvent::CallEnded => {
                info!("camera call ended");
                self.teardown_call(wiring, call).await;
            }
            CameraEvent::HealthUpdate(health) => {
                debug!(
                    battery = ?health.battery_percent,
                    connected = health.connected,
                    "camera health update"
                );
                self.health.record_camera(health).await;
            }
        }
    }

    async fn start_camera_call(&self, wiring: &Wiring, call: &mut ActiveCall) {
        if call.camera_call.is_some() {
            debug!("camera call already active");
            return;
        }
        match self.camera.start_call().await {
            Ok(live) => {
                call.camera_call = Some(live);
            }
            Err(err) => {
                warn!(error = %err, "failed to start camera call");
                self.teardown_call(wiring, call).await;
            }
        }
    }

    /// Release everything the current call holds. Every resource sits behind
    /// an `Option::take` or a cancellation token, so running this twice (BYE
    /// then operator interrupt, say) produces no duplicate traffic.
    async fn teardown_call(&self, wiring: &Wiring, call: &mut ActiveCall) {
        wiring.agent.hangup().await;
        if let Some(live) = call.camera_call.take() {
            if let Err(err) = live.stop().await {
                warn!(error = %err, "failed to stop camera call");
            }
        }
        wiring.rtp.stop_receiving().await;
        wiring.tones.clear().await;
        if let Some(writer) = call.sip_writer.take() {
            writer.close();
        }
        if let Some(writer) = call.camera_writer.take() {
            writer.close();
        }
        call.camera_tone_ready = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraCall, CameraHealth};
    use crate::config::{
        BindConfig, MediaConfig, SipConfig, TimerConfig, ToneConfig, TransportProfile,
    };
    use crate::media::RtpPacket;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockLive {
        stopped: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CameraCall for MockLive {
        async fn activate_speaker(&self) -> Result<()> {
            Ok(())
        }

        async fn send_audio(&self, _packet: RtpPacket) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockCamera {
        live: Arc<MockLive>,
    }

    #[async_trait::async_trait]
    impl CameraClient for MockCamera {
        async fn initialize(&self, _events: mpsc::UnboundedSender<CameraEvent>) -> Result<()> {
            Ok(())
        }

        async fn start_call(&self) -> Result<Arc<dyn CameraCall>> {
            Ok(self.live.clone())
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig {
            sip: SipConfig {
                bind: BindConfig {
                    address: "127.0.0.1".parse().unwrap(),
                    port: 0,
                    interface: None,
                },
                server_addr: "127.0.0.1".parse().unwrap(),
                server_port: 5060,
                domain: "example.net".into(),
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
                invite_timeout_secs: 1,
            },
            health: None,
            user_agent: None,
        }
    }

    fn fixture() -> (Orchestrator<MockCamera>, Wiring, Arc<MockLive>) {
        let config = Arc::new(config());
        let live = Arc::new(MockLive {
            stopped: AtomicUsize::new(0),
        });
        let camera = Arc::new(MockCamera { live: live.clone() });
        let orchestrator = Orchestrator::new(config.clone(), camera, HealthState::new());

        let rtp = RtpEndpoint::bind(&config.media).expect("bind loopback rtp");
        let (sip_tx, _sip_rx) = mpsc::unbounded_channel();
        // Deliberately not initialized: call control fails fast, which is
        // what the failure-path tests need.
        let agent = SipAgent::new(&config, rtp.local_addr(), sip_tx);
        let wiring = Wiring {
            agent,
            tones: ToneInjector::new(config.tones.clone()),
            rtp,
        };
        (orchestrator, wiring, live)
    }

    #[tokio::test]
    async fn sip_failure_after_button_press_stops_the_camera_call() {
        let (orchestrator, wiring, live) = fixture();
        let mut call = ActiveCall::default();

        orchestrator
            .on_camera_event(&wiring, &mut call, CameraEvent::ButtonPressed)
            .await;

        assert!(call.camera_call.is_none());
        assert_eq!(live.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn teardown_twice_stops_the_camera_call_once() {
        let (orchestrator, wiring, live) = fixture();
        let mut call = ActiveCall {
            camera_call: Some(live.clone()),
            ..ActiveCall::default()
        };

        orchestrator.teardown_call(&wiring, &mut call).await;
        orchestrator.teardown_call(&wiring, &mut call).await;

        assert_eq!(live.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn camera_audio_without_a_sip_leg_is_dropped() {
        let (orchestrator, wiring, _live) = fixture();
        let mut call = ActiveCall::default();

        let packet = RtpPacket::new(crate::media::RtpHeader::new(96, 1, 0, 7), bytes::Bytes::new());
        orchestrator
            .on_camera_event(&wiring, &mut call, CameraEvent::AudioReceived(packet))
            .await;

        assert!(!call.camera_tone_ready);
    }

    #[tokio::test]
    async fn health_updates_reach_the_snapshot() {
        let (orchestrator, wiring, _live) = fixture();
        let mut call = ActiveCall::default();

        orchestrator
            .on_camera_event(
                &wiring,
                &mut call,
                CameraEvent::HealthUpdate(CameraHealth {
                    battery_percent: Some(55.0),
                    connected: true,
                }),
            )
            .await;

        let snapshot = orchestrator.health.snapshot().await;
        assert_eq!(snapshot.battery_percent, Some(55.0));
        assert!(snapshot.camera_connected);
    }
}

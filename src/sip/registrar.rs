use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use ftth_rsipstack::rsip;
use ftth_rsipstack::transaction::Endpoint;
use ftth_rsipstack::transaction::key::{TransactionKey, TransactionRole};
use ftth_rsipstack::transaction::transaction::Transaction;
use ftth_rsipstack::transport::SipAddr;
use rsip::common::uri::param::Tag;
use rsip::headers::Contact;
use rsip::transport::Transport;
use rsip::typed;
use rsip::{Method, Param, SipMessage, StatusCode, Uri, Version};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{SipConfig, TimerConfig};
use crate::error::{Error, Result};

use super::auth::{DigestChallenge, build_authorization, challenge_from_response};
use super::state::SipEvent;
use super::utils::{format_socket_for_sip, generate_call_id, strip_rport_param};

/// Keeps the bridge's address-of-record registered with the SIP server.
///
/// One REGISTER immediately, then one every `registration_refresh_secs`,
/// which doubles as the requested Expires value. Observers hear about
/// registration changes only when the state actually flips.
pub(super) struct RegistrationTask {
    config: SipConfig,
    timers: TimerConfig,
    endpoint: Arc<Endpoint>,
    local_socket: SocketAddr,
    events: mpsc::UnboundedSender<SipEvent>,
    shutdown: CancellationToken,
    call_id: rsip::headers::CallId,
    cseq: AtomicU32,
    nonce_count: AtomicU32,
    challenge: RwLock<Option<DigestChallenge>>,
    registered: AtomicBool,
    removed: AtomicBool,
}

enum AttemptOutcome {
    Accepted,
    Challenged,
}

impl RegistrationTask {
    pub(super) fn new(
        config: SipConfig,
        timers: TimerConfig,
        endpoint: Arc<Endpoint>,
        local_socket: SocketAddr,
        events: mpsc::UnboundedSender<SipEvent>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let call_id = generate_call_id(&config.domain);
        Arc::new(Self {
            config,
            timers,
            endpoint,
            local_socket,
            events,
            shutdown,
            call_id,
            cseq: AtomicU32::new(1),
            nonce_count: AtomicU32::new(0),
            challenge: RwLock::new(None),
            registered: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        })
    }

    pub(super) async fn run(self: Arc<Self>) {
        info!(domain = %self.config.domain, "starting registration loop");
        let refresh = Duration::from_secs(self.timers.registration_refresh_secs.max(1));
        let expires = self.timers.registration_refresh_secs.min(u32::MAX as u64) as u32;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("registration loop shutdown requested");
                    break;
                }
                result = self.register_once(expires) => {
                    match result {
                        Ok(()) => self.note_registration(true),
                        Err(err) => {
                            warn!(error = %err, "REGISTER failed");
                            self.note_registration(false);
                        }
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            info!("registration loop shutdown requested");
                            break;
                        }
                        _ = tokio::time::sleep(refresh) => {}
                    }
                }
            }
        }

        info!("registration loop stopped");
    }

    /// Drop the binding with one `Expires: 0` REGISTER. Only meaningful when
    /// currently registered, and never sent more than once.
    pub(super) async fn unregister(&self) {
        if !self.registered.load(Ordering::SeqCst) {
            return;
        }
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("removing registration");
        if let Err(err) = self.register_once(0).await {
            warn!(error = %err, "failed to remove registration");
        }
        self.note_registration(false);
    }

    async fn register_once(&self, expires: u32) -> Result<()> {
        let timeout = Duration::from_secs(self.timers.register_timeout_secs.max(1));
        let mut include_auth = self.challenge.read().await.is_some();
        let mut challenged_before = false;

        loop {
            let request = self.prepare_register_request(expires, include_auth).await?;
            let outcome = tokio::time::timeout(timeout, self.register_attempt(request))
                .await
                .map_err(|_| Error::sip_stack("timed out waiting for REGISTER response"))??;

            match outcome {
                AttemptOutcome::Accepted => {
                    self.nonce_count.store(0, Ordering::SeqCst);
                    return Ok(());
                }
                AttemptOutcome::Challenged => {
                    // One authenticated retry; a second challenge means the
                    // credentials are wrong and retrying cannot fix it.
                    if challenged_before {
                        return Err(Error::sip_stack("REGISTER credentials rejected"));
                    }
                    if self.config.auth.is_none() {
                        return Err(Error::configuration(
                            "registrar requires authentication but no credentials are configured",
                        ));
                    }
                    challenged_before = true;
                    include_auth = true;
                }
            }
        }
    }

    async fn register_attempt(&self, request: rsip::Request) -> Result<AttemptOutcome> {
        let mut tx = self.start_client_transaction(request).await?;

        while let Some(message) = tx.receive().await {
            let SipMessage::Response(response) = message else {
                continue;
            };
            debug!(status = %response.status_code, "REGISTER response");
            match response.status_code {
                StatusCode::Trying => continue,
                StatusCode::OK => return Ok(AttemptOutcome::Accepted),
                StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                    let challenge = challenge_from_response(&response)?;
                    let mut guard = self.challenge.write().await;
                    *guard = Some(challenge);
                    return Ok(AttemptOutcome::Challenged);
                }
                other => {
                    return Err(Error::sip_stack(format!("REGISTER rejected with {other}")));
                }
            }
        }

        Err(Error::sip_stack("no final response to REGISTER"))
    }

    async fn prepare_register_request(
        &self,
        expires: u32,
        include_authorization: bool,
    ) -> Result<rsip::Request> {
        let registrar_uri = format!("sip:{}", self.config.domain);
        let registrar_uri = Uri::try_from(registrar_uri.as_str()).map_err(Error::sip_stack)?;

        let mut request = rsip::Request {
            method: Method::Register,
            uri: registrar_uri,
            version: Version::default(),
            headers: rsip::Headers::default(),
            body: Vec::new(),
        };

        let mut via_addr: SipAddr = self.local_socket.into();
        via_addr.r#type = Some(Transport::Udp);
        let mut via = self
            .endpoint
            .inner
            .get_via(Some(via_addr), None)
            .map_err(Error::sip_stack)?;
        strip_rport_param(&mut via);
        request.headers.unique_push(rsip::Header::Via(via.into()));
        request
            .headers
            .unique_push(rsip::Header::MaxForwards(rsip::headers::MaxForwards::from(
                70u32,
            )));

        let aor = format!("sip:{}@{}", self.config.username, self.config.domain);
        let aor = Uri::try_from(aor.as_str()).map_err(Error::sip_stack)?;

        let from_header = typed::From {
            display_name: None,
            uri: aor.clone(),
            params: vec![Param::Tag(Tag::default())],
        };
        request
            .headers
            .unique_push(rsip::Header::From(from_header.into()));

        let to_header = typed::To {
            display_name: None,
            uri: aor,
            params: Vec::new(),
        };
        request.headers.unique_push(rsip::Header::To(to_header.into()));

        request
            .headers
            .unique_push(rsip::Header::CallId(self.call_id.clone()));

        let seq = self.cseq.fetch_add(1, Ordering::SeqCst);
        let cseq = typed::CSeq {
            seq,
            method: Method::Register,
        };
        request.headers.unique_push(rsip::Header::CSeq(cseq.into()));

        let contact = format!(
            "<sip:{}@{}>",
            self.config.username,
            format_socket_for_sip(&self.local_socket)
        );
        request
            .headers
            .unique_push(rsip::Header::Contact(Contact::from(contact)));

        request
            .headers
            .unique_push(rsip::Header::Expires(rsip::headers::Expires::from(expires)));

        if include_authorization {
            let credentials = self.config.auth.as_ref().ok_or_else(|| {
                Error::configuration(
                    "registrar requires authentication but no credentials are configured",
                )
            })?;
            let challenge = {
                let guard = self.challenge.read().await;
                guard
                    .as_ref()
                    .cloned()
                    .ok_or_else(|| Error::configuration("authentication challenge not available"))?
            };
            let nonce_count = self.nonce_count.fetch_add(1, Ordering::SeqCst) + 1;
            let authorization = build_authorization(credentials, &challenge, &request, nonce_count)?;
            request
                .headers
                .unique_push(rsip::Header::Authorization(authorization.into()));
        }

        request.headers.unique_push(rsip::Header::ContentLength(
            rsip::headers::ContentLength::from(0u32),
        ));

        Ok(request)
    }

    fn server_target(&self) -> SipAddr {
        let mut target: SipAddr = self.config.server_socket_addr().into();
        target.r#type = Some(Transport::Udp);
        target
    }

    async fn start_client_transaction(&self, request: rsip::Request) -> Result<Transaction> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)
            .map_err(Error::sip_stack)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.inner.clone(), None);
        tx.destination = Some(self.server_target());
        tx.send().await.map_err(Error::sip_stack)?;
        Ok(tx)
    }

    fn note_registration(&self, registered: bool) {
        if self.registered.swap(registered, Ordering::SeqCst) != registered {
            info!(registered, "registration state changed");
            let _ = self.events.send(SipEvent::RegistrationChanged { registered });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftth_rsipstack::EndpointBuilder;
    use std::net::{IpAddr, Ipv4Addr};

    fn fixture(events: mpsc::UnboundedSender<SipEvent>) -> Arc<RegistrationTask> {
        let config = SipConfig {
            bind: crate::config::BindConfig {
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0,
                interface: None,
            },
            server_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_port: 5060,
            domain: "example.net".into(),
            username: "doorbell".into(),
            extension: "100".into(),
            auth: None,
            transport: crate::config::TransportProfile::Udp,
        };
        let timers = TimerConfig {
            registration_refresh_secs: 600,
            register_timeout_secs: 8,
            invite_timeout_secs: 32,
        };
        let endpoint = Arc::new(EndpointBuilder::new().build());
        RegistrationTask::new(
            config,
            timers,
            endpoint,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5060),
            events,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn notifies_only_when_registration_state_flips() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = fixture(tx);

        task.note_registration(true);
        task.note_registration(true);
        assert!(matches!(
            rx.try_recv(),
            Ok(SipEvent::RegistrationChanged { registered: true })
        ));
        assert!(rx.try_recv().is_err());

        task.note_registration(false);
        assert!(matches!(
            rx.try_recv(),
            Ok(SipEvent::RegistrationChanged { registered: false })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_is_a_no_op_when_never_registered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = fixture(tx);

        // Must not attempt any network traffic or emit events.
        task.unregister().await;
        assert!(rx.try_recv().is_err());
    }
}

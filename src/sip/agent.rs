//! The SIP endpoint the bridge presents to the phone network.
//!
//! One UDP listener, one transaction-layer endpoint, at most one call at a
//! time. Outbound calls are driven by a spawned task per INVITE; inbound
//! INVITEs are answered immediately (100/180/200) because the doorbell has
//! nobody to consult before picking up. Everything observable is reported
//! through [`SipEvent`]s; media never touches this module beyond the SDP
//! bodies it carries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ftth_rsipstack::EndpointBuilder;
use ftth_rsipstack::rsip;
use ftth_rsipstack::transaction::Endpoint;
use ftth_rsipstack::transaction::endpoint::MessageInspector;
use ftth_rsipstack::transaction::key::{TransactionKey, TransactionRole};
use ftth_rsipstack::transaction::transaction::Transaction;
use ftth_rsipstack::transport::udp::{UdpConnection, UdpInner};
use ftth_rsipstack::transport::{SipAddr, SipConnection, TransportLayer};
use rsip::common::uri::param::Tag;
use rsip::headers::{
    CallId as HeaderCallId, Contact, ContentEncoding, ContentLength as HeaderContentLength,
    ContentType, From as HeaderFrom, Subject, Supported, To as HeaderTo, ToTypedHeader,
    UntypedHeader, Via as HeaderVia,
};
use rsip::message::headers_ext::HeadersExt;
use rsip::transport::Transport;
use rsip::typed;
use rsip::{Method, Param, SipMessage, StatusCode, StatusCodeKind, Uri, Version};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, SipAuth, SipConfig, TimerConfig};
use crate::error::{Error, Result};
use crate::net::bind_udp_socket;
use crate::sdp::{RemoteMedia, build_local_offer, parse_remote_offer};

use super::auth::{DigestChallenge, build_authorization, challenge_from_response};
use super::registrar::RegistrationTask;
use super::state::{CallSlot, Dialog, PendingOutbound, SipEvent};
use super::utils::{format_socket_for_sip, generate_call_id, strip_rport_param};

/// Stamps our User-Agent on everything leaving the endpoint and drops the
/// rport parameter some stacks insist on adding to request Vias.
#[derive(Debug)]
struct BridgeMessageInspector {
    user_agent: String,
}

impl BridgeMessageInspector {
    fn new(user_agent: String) -> Self {
        Self { user_agent }
    }

    fn stamp_user_agent(&self, headers: &mut rsip::headers::Headers) {
        headers.retain(|header| match header {
            rsip::Header::UserAgent(_) => false,
            rsip::Header::Other(name, _) => !name.eq_ignore_ascii_case("User-Agent"),
            _ => true,
        });
        headers.push(rsip::Header::UserAgent(rsip::headers::UserAgent::from(
            self.user_agent.clone(),
        )));
    }
}

impl MessageInspector for BridgeMessageInspector {
    fn before_send(&self, msg: SipMessage) -> SipMessage {
        match msg {
            SipMessage::Request(mut req) => {
                if let Ok(via) = req.via_header_mut()
                    && let Ok(mut typed) = via.clone().typed()
                {
                    strip_rport_param(&mut typed);
                    *via = typed.into();
                }
                self.stamp_user_agent(&mut req.headers);
                SipMessage::Request(req)
            }
            SipMessage::Response(mut res) => {
                self.stamp_user_agent(&mut res.headers);
                SipMessage::Response(res)
            }
        }
    }

    fn after_received(&self, msg: SipMessage) -> SipMessage {
        msg
    }
}

struct AgentInner {
    sip: SipConfig,
    timers: TimerConfig,
    user_agent: String,
    /// RTP socket address as bound; unspecified hosts are resolved against
    /// the SIP listener before being advertised in SDP.
    rtp_addr: SocketAddr,
    endpoint: RwLock<Option<Arc<Endpoint>>>,
    transport_cancel: RwLock<CancellationToken>,
    listener: RwLock<Option<SocketAddr>>,
    advertised_rtp: RwLock<Option<SocketAddr>>,
    events: mpsc::UnboundedSender<SipEvent>,
    call: RwLock<CallSlot>,
    registrar: RwLock<Option<Arc<RegistrationTask>>>,
    session_counter: AtomicU64,
}

enum InviteOutcome {
    Established(Dialog, RemoteMedia),
    Failed {
        status: Option<StatusCode>,
        reason: String,
    },
    Cancelled,
}

#[derive(Clone)]
pub struct SipAgent {
    inner: Arc<AgentInner>,
}

impl SipAgent {
    pub fn new(
        config: &BridgeConfig,
        rtp_addr: SocketAddr,
        events: mpsc::UnboundedSender<SipEvent>,
    ) -> Self {
        let session_seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_secs();

        Self {
            inner: Arc::new(AgentInner {
                sip: config.sip.clone(),
                timers: config.timers.clone(),
                user_agent: config.resolved_user_agent(),
                rtp_addr,
                endpoint: RwLock::new(None),
                transport_cancel: RwLock::new(CancellationToken::new()),
                listener: RwLock::new(None),
                advertised_rtp: RwLock::new(None),
                events,
                call: RwLock::new(CallSlot::Idle),
                registrar: RwLock::new(None),
                session_counter: AtomicU64::new(session_seed),
            }),
        }
    }

    /// Bind the listener and build the transaction-layer endpoint. Must run
    /// before [`SipAgent::run`].
    pub async fn initialize(&self) -> Result<()> {
        info!(
            listener = %self.inner.sip.bind.socket_addr(),
            "initializing SIP transport"
        );

        let cancel = CancellationToken::new();
        let transport_layer = TransportLayer::new(cancel.clone());

        let (connection, listener) =
            create_udp_listener(&self.inner.sip.bind, cancel.child_token()).await?;
        transport_layer.add_transport(connection.into());
        *self.inner.listener.write().await = Some(listener);

        let advertised_rtp = if self.inner.rtp_addr.ip().is_unspecified() {
            SocketAddr::new(listener.ip(), self.inner.rtp_addr.port())
        } else {
            self.inner.rtp_addr
        };
        *self.inner.advertised_rtp.write().await = Some(advertised_rtp);

        let mut endpoint_builder = EndpointBuilder::new();
        endpoint_builder
            .with_cancel_token(cancel.clone())
            .with_transport_layer(transport_layer)
            .with_inspector(Box::new(BridgeMessageInspector::new(
                self.inner.user_agent.clone(),
            )));
        let endpoint = Arc::new(endpoint_builder.build());

        self.inner.endpoint.write().await.replace(endpoint);
        *self.inner.transport_cancel.write().await = cancel;

        Ok(())
    }

    /// Serve incoming transactions and keep the registration fresh until
    /// `shutdown` fires. The endpoint itself stays usable afterwards so a
    /// final un-REGISTER can still go out; call [`SipAgent::shutdown`] last.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let endpoint = self.endpoint().await?;
        let listener = self.listener().await?;
        info!(domain = %self.inner.sip.domain, %listener, "SIP agent started");

        let mut incoming = endpoint.incoming_transactions().map_err(Error::sip_stack)?;
        let serve_endpoint = endpoint.clone();
        let mut serve_handle = tokio::spawn(async move { serve_endpoint.serve().await });

        let registrar_shutdown = CancellationToken::new();
        let registrar = RegistrationTask::new(
            self.inner.sip.clone(),
            self.inner.timers.clone(),
            endpoint.clone(),
            listener,
            self.inner.events.clone(),
            registrar_shutdown.clone(),
        );
        self.inner.registrar.write().await.replace(registrar.clone());
        let registrar_handle = tokio::spawn(registrar.run());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = &mut serve_handle => {
                    warn!("endpoint serve loop exited");
                    break;
                }
                maybe_tx = incoming.recv() => {
                    let Some(tx) = maybe_tx else {
                        warn!("transaction stream closed");
                        break;
                    };
                    let agent = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = agent.process_transaction(tx).await {
                            warn!(error = %err, "failed to process transaction");
                        }
                    });
                }
            }
        }

        registrar_shutdown.cancel();
        if let Err(join_err) = registrar_handle.await {
            error!(error = %join_err, "registration task failed");
        }

        info!("SIP agent stopped");
        Ok(())
    }

    /// Remove the registration binding if one is active. Safe after
    /// [`SipAgent::run`] has returned, as long as `shutdown` was not called.
    pub async fn unregister(&self) {
        let registrar = self.inner.registrar.read().await.clone();
        if let Some(registrar) = registrar {
            registrar.unregister().await;
        }
    }

    pub async fn shutdown(&self) {
        info!("SIP agent shutting down");
        if let Some(endpoint) = self.inner.endpoint.write().await.take() {
            endpoint.shutdown();
        }
        self.inner.transport_cancel.write().await.cancel();
        self.inner.registrar.write().await.take();
    }

    /// Dial the configured extension. Returns once the INVITE is on the wire;
    /// progress arrives as [`SipEvent`]s.
    pub async fn place_call(&self) -> Result<()> {
        let endpoint = self.endpoint().await?;
        let listener = self.listener().await?;
        let invite = self.prepare_invite(&endpoint, listener).await?;
        let call_id = invite
            .call_id_header()
            .map_err(Error::sip_stack)?
            .value()
            .to_string();
        let cancel = CancellationToken::new();

        {
            let mut slot = self.inner.call.write().await;
            if !slot.is_idle() {
                return Err(Error::sip_stack(format!(
                    "cannot place call while in state {:?}",
                    *slot
                )));
            }
            *slot = CallSlot::Dialing(PendingOutbound {
                call_id: call_id.clone(),
                cancel: cancel.clone(),
            });
        }

        info!(
            call_id,
            extension = %self.inner.sip.extension,
            "placing outbound call"
        );

        let agent = self.clone();
        tokio::spawn(async move {
            agent.drive_outbound_invite(invite, cancel).await;
        });
        Ok(())
    }

    /// Tear down whatever call is in progress: BYE for an established dialog,
    /// CANCEL for an in-flight INVITE, nothing when idle. Idempotent; the
    /// slot is taken under the lock so two racing hangups send one message.
    pub async fn hangup(&self) {
        let slot = {
            let mut guard = self.inner.call.write().await;
            std::mem::replace(&mut *guard, CallSlot::Idle)
        };

        match slot {
            CallSlot::Idle => {}
            CallSlot::Dialing(pending) => {
                info!(call_id = %pending.call_id, "cancelling outbound call");
                pending.cancel.cancel();
            }
            CallSlot::Established(dialog) => {
                info!(call_id = %dialog.call_id, "hanging up");
                self.send_bye(&dialog).await;
            }
        }
    }

    async fn drive_outbound_invite(&self, invite: rsip::Request, cancel: CancellationToken) {
        match self.run_outbound_invite(invite, &cancel).await {
            Ok(InviteOutcome::Established(dialog, media)) => {
                {
                    let mut slot = self.inner.call.write().await;
                    *slot = CallSlot::Established(dialog);
                }
                self.emit(SipEvent::CallEstablished(media));
            }
            Ok(InviteOutcome::Failed { status, reason }) => {
                self.clear_call_slot().await;
                self.emit(SipEvent::CallFailed { status, reason });
            }
            // Hangup already cleared the slot; nothing to report.
            Ok(InviteOutcome::Cancelled) => {}
            Err(err) => {
                warn!(error = %err, "outbound INVITE failed");
                self.clear_call_slot().await;
                self.emit(SipEvent::CallFailed {
                    status: None,
                    reason: err.to_string(),
                });
            }
        }
    }

    async fn run_outbound_invite(
        &self,
        invite: rsip::Request,
        cancel: &CancellationToken,
    ) -> Result<InviteOutcome> {
        let mut request = invite;
        let mut challenged_before = false;

        let timeout =
            tokio::time::sleep(Duration::from_secs(self.inner.timers.invite_timeout_secs.max(1)));
        tokio::pin!(timeout);

        'attempts: loop {
            let mut tx = self.start_client_transaction(request.clone()).await?;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.send_cancel(&request).await;
                        return Ok(InviteOutcome::Cancelled);
                    }
                    _ = &mut timeout => {
                        warn!("outbound INVITE timed out");
                        self.send_cancel(&request).await;
                        return Ok(InviteOutcome::Failed {
                            status: None,
                            reason: "no answer before timeout".into(),
                        });
                    }
                    maybe_message = tx.receive() => {
                        let Some(message) = maybe_message else {
                            return Ok(InviteOutcome::Failed {
                                status: None,
                                reason: "transaction closed without final response".into(),
                            });
                        };
                        let SipMessage::Response(mut response) = message else {
                            continue;
                        };
                        Self::expand_compact_headers(&mut response.headers);
                        debug!(status = %response.status_code, "INVITE response");

                        if matches!(response.status_code.kind(), StatusCodeKind::Provisional) {
                            if response.status_code == StatusCode::Ringing {
                                self.emit(SipEvent::RemoteRinging);
                            }
                            continue;
                        }
                        if matches!(response.status_code.kind(), StatusCodeKind::Successful) {
                            return self.complete_outbound_dialog(&request, &response).await;
                        }

                        match response.status_code {
                            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                                // The stack ACKs the failed final itself; one
                                // authenticated retry, then give up.
                                if challenged_before {
                                    return Ok(InviteOutcome::Failed {
                                        status: Some(response.status_code.clone()),
                                        reason: "INVITE credentials rejected".into(),
                                    });
                                }
                                let Some(credentials) = self.inner.sip.auth.clone() else {
                                    return Ok(InviteOutcome::Failed {
                                        status: Some(response.status_code.clone()),
                                        reason: "INVITE challenged but no credentials configured"
                                            .into(),
                                    });
                                };
                                let challenge = challenge_from_response(&response)?;
                                request =
                                    Self::reauthorize_invite(&request, &credentials, &challenge)?;
                                challenged_before = true;
                                continue 'attempts;
                            }
                            other => {
                                return Ok(InviteOutcome::Failed {
                                    status: Some(other.clone()),
                                    reason: format!("call rejected with {other}"),
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    async fn complete_outbound_dialog(
        &self,
        request: &rsip::Request,
        response: &rsip::Response,
    ) -> Result<InviteOutcome> {
        let call_id = request
            .call_id_header()
            .map_err(Error::sip_stack)?
            .value()
            .to_string();
        let local_tag = request
            .from_header()
            .map_err(Error::sip_stack)?
            .tag()
            .map_err(Error::sip_stack)?
            .ok_or_else(|| Error::sip_stack("outbound INVITE missing From tag"))?;
        let local_uri = request
            .from_header()
            .map_err(Error::sip_stack)?
            .typed()
            .map_err(Error::sip_stack)?
            .uri;
        let remote_uri = request
            .to_header()
            .map_err(Error::sip_stack)?
            .typed()
            .map_err(Error::sip_stack)?
            .uri;
        let seq = request
            .cseq_header()
            .map_err(Error::sip_stack)?
            .typed()
            .map_err(Error::sip_stack)?
            .seq;

        let remote_tag = response
            .to_header()
            .ok()
            .and_then(|header| header.tag().ok().flatten());
        let remote_contact = response
            .contact_header()
            .ok()
            .and_then(|header| header.typed().ok().map(|typed| typed.uri));
        let remote_target = remote_contact.unwrap_or_else(|| remote_uri.clone());

        // ACK for a 2xx is its own transaction addressed at the answer's
        // Contact, reusing the INVITE's CSeq number.
        if let Err(err) = self.send_ack(request, response, &remote_target, seq).await {
            warn!(error = %err, "failed to ACK 200");
        }

        let dialog = Dialog {
            call_id,
            local_uri,
            remote_uri,
            local_tag,
            remote_tag,
            remote_target,
            local_cseq: seq,
        };

        let body = String::from_utf8_lossy(&response.body);
        match parse_remote_offer(&body) {
            Some(media) => Ok(InviteOutcome::Established(dialog, media)),
            None => {
                info!(call_id = %dialog.call_id, "answer carries no usable audio, hanging up");
                self.send_bye(&dialog).await;
                Ok(InviteOutcome::Failed {
                    status: None,
                    reason: "answer carries no usable audio".into(),
                })
            }
        }
    }

    async fn process_transaction(&self, mut tx: Transaction) -> Result<()> {
        Self::expand_compact_headers(&mut tx.original.headers);

        match tx.original.method.clone() {
            Method::Invite => self.handle_invite(tx).await,
            Method::Ack => self.handle_ack(&tx),
            Method::Bye => self.handle_bye(&mut tx).await,
            Method::Cancel => self.handle_cancel(&mut tx).await,
            Method::Options => self.handle_options(&mut tx).await,
            _ => {
                tx.reply(StatusCode::NotImplemented)
                    .await
                    .map_err(Error::sip_stack)?;
                Ok(())
            }
        }
        .or_else(|err| {
            if Self::is_transaction_already_terminated(&err) {
                debug!(error = %err, "late reply to a finished transaction");
                Ok(())
            } else {
                Err(err)
            }
        })
    }

    async fn handle_invite(&self, mut tx: Transaction) -> Result<()> {
        let call_id = tx
            .original
            .call_id_header()
            .map_err(Error::sip_stack)?
            .value()
            .to_string();

        // The slot stays locked until the dialog is stored so a concurrent
        // button press cannot claim it between our 100 and 200.
        let mut slot = self.inner.call.write().await;
        if !slot.is_idle() {
            let status = if slot.call_id() == Some(call_id.as_str()) {
                // Re-INVITE; mid-call renegotiation is not supported.
                StatusCode::NotAcceptableHere
            } else {
                StatusCode::BusyHere
            };
            debug!(call_id, state = ?*slot, status = %status, "rejecting INVITE");
            tx.reply(status).await.map_err(Error::sip_stack)?;
            return Ok(());
        }

        let body = String::from_utf8_lossy(&tx.original.body).to_string();
        let Some(remote_media) = parse_remote_offer(&body) else {
            info!(call_id, "inbound INVITE offers no usable audio");
            tx.reply(StatusCode::NotAcceptableHere)
                .await
                .map_err(Error::sip_stack)?;
            return Ok(());
        };

        let from_typed = tx
            .original
            .from_header()
            .map_err(Error::sip_stack)?
            .typed()
            .map_err(Error::sip_stack)?;
        let to_typed = tx
            .original
            .to_header()
            .map_err(Error::sip_stack)?
            .typed()
            .map_err(Error::sip_stack)?;
        let remote_tag = tx
            .original
            .from_header()
            .map_err(Error::sip_stack)?
            .tag()
            .map_err(Error::sip_stack)?;
        let remote_target = tx
            .original
            .contact_header()
            .ok()
            .and_then(|header| header.typed().ok().map(|typed| typed.uri))
            .unwrap_or_else(|| from_typed.uri.clone());

        info!(call_id, caller = %from_typed.uri, "answering inbound call");
        tx.send_trying().await.map_err(Error::sip_stack)?;
        self.emit(SipEvent::InboundCall);

        let listener = self.listener().await?;
        let local_tag = Tag::default();

        let ringing =
            Self::dialog_response(&tx.original, StatusCode::Ringing, &local_tag, None, None)?;
        tx.respond(ringing).await.map_err(Error::sip_stack)?;

        let sdp = self.local_offer().await?;
        let contact = format!(
            "<sip:{}@{}>",
            self.inner.sip.username,
            format_socket_for_sip(&listener)
        );
        let answer = Self::dialog_response(
            &tx.original,
            StatusCode::OK,
            &local_tag,
            Some(contact),
            Some(sdp.into_bytes()),
        )?;
        tx.respond(answer).await.map_err(Error::sip_stack)?;

        *slot = CallSlot::Established(Dialog {
            call_id,
            local_uri: to_typed.uri.clone(),
            remote_uri: from_typed.uri.clone(),
            local_tag,
            remote_tag,
            remote_target,
            local_cseq: 0,
        });
        drop(slot);

        self.emit(SipEvent::CallEstablished(remote_media));
        Ok(())
    }

    fn handle_ack(&self, tx: &Transaction) -> Result<()> {
        // ACK for our 2xx; the dialog is already established.
        if let Ok(call_id) = tx.original.call_id_header() {
            debug!(call_id = %call_id.value(), "ACK received");
        }
        Ok(())
    }

    async fn handle_bye(&self, tx: &mut Transaction) -> Result<()> {
        let call_id = tx
            .original
            .call_id_header()
            .map_err(Error::sip_stack)?
            .value()
            .to_string();

        // Acknowledge first so the peer stops retransmitting.
        tx.reply(StatusCode::OK).await.map_err(Error::sip_stack)?;

        let ended = {
            let mut slot = self.inner.call.write().await;
            if slot.call_id() == Some(call_id.as_str()) {
                if let CallSlot::Dialing(pending) =
                    std::mem::replace(&mut *slot, CallSlot::Idle)
                {
                    pending.cancel.cancel();
                }
                true
            } else {
                false
            }
        };

        if ended {
            info!(call_id, "call ended by remote");
            self.emit(SipEvent::CallEnded);
        } else {
            debug!(call_id, "BYE for unknown call ignored");
        }
        Ok(())
    }

    async fn handle_cancel(&self, tx: &mut Transaction) -> Result<()> {
        let call_id = tx
            .original
            .call_id_header()
            .map_err(Error::sip_stack)?
            .value()
            .to_string();

        // Inbound INVITEs are answered in one sweep, so there is never an
        // unanswered INVITE transaction left for a CANCEL to terminate.
        debug!(call_id, "CANCEL without matching pending INVITE");
        tx.reply(StatusCode::CallTransactionDoesNotExist)
            .await
            .map_err(Error::sip_stack)?;
        Ok(())
    }

    async fn handle_options(&self, tx: &mut Transaction) -> Result<()> {
        let headers = vec![
            rsip::Header::Other("Allow".into(), "INVITE, ACK, CANCEL, BYE, OPTIONS".into()),
            rsip::Header::Other("Accept".into(), "application/sdp".into()),
        ];

        tx.reply_with(StatusCode::OK, headers, None)
            .await
            .map_err(Error::sip_stack)
    }

    async fn prepare_invite(
        &self,
        endpoint: &Arc<Endpoint>,
        listener: SocketAddr,
    ) -> Result<rsip::Request> {
        let extension_uri = format!(
            "sip:{}@{}",
            self.inner.sip.extension, self.inner.sip.domain
        );
        let extension_uri = Uri::try_from(extension_uri.as_str()).map_err(Error::sip_stack)?;
        let sdp = self.local_offer().await?;

        let mut request = rsip::Request {
            method: Method::Invite,
            uri: extension_uri.clone(),
            version: Version::default(),
            headers: rsip::Headers::default(),
            body: sdp.into_bytes(),
        };

        let mut via_addr: SipAddr = listener.into();
        via_addr.r#type = Some(Transport::Udp);
        let mut via = endpoint
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

        let aor = format!("sip:{}@{}", self.inner.sip.username, self.inner.sip.domain);
        let aor = Uri::try_from(aor.as_str()).map_err(Error::sip_stack)?;
        let from_header = typed::From {
            display_name: None,
            uri: aor,
            params: vec![Param::Tag(Tag::default())],
        };
        request
            .headers
            .unique_push(rsip::Header::From(from_header.into()));

        let to_header = typed::To {
            display_name: None,
            uri: extension_uri,
            params: Vec::new(),
        };
        request.headers.unique_push(rsip::Header::To(to_header.into()));

        request.headers.unique_push(rsip::Header::CallId(generate_call_id(
            &self.inner.sip.domain,
        )));

        let cseq = typed::CSeq {
            seq: 1,
            method: Method::Invite,
        };
        request.headers.unique_push(rsip::Header::CSeq(cseq.into()));

        let contact = format!(
            "<sip:{}@{}>",
            self.inner.sip.username,
            format_socket_for_sip(&listener)
        );
        request
            .headers
            .unique_push(rsip::Header::Contact(Contact::from(contact)));

        request
            .headers
            .unique_push(rsip::Header::ContentType(ContentType::from(
                "application/sdp",
            )));
        request.headers.unique_push(rsip::Header::ContentLength(
            HeaderContentLength::from(request.body.len() as u32),
        ));

        Ok(request)
    }

    fn reauthorize_invite(
        original: &rsip::Request,
        credentials: &SipAuth,
        challenge: &DigestChallenge,
    ) -> Result<rsip::Request> {
        let mut request = original.clone();
        let seq = request
            .cseq_header()
            .map_err(Error::sip_stack)?
            .typed()
            .map_err(Error::sip_stack)?
            .seq
            + 1;
        request.headers.unique_push(rsip::Header::CSeq(
            typed::CSeq {
                seq,
                method: Method::Invite,
            }
            .into(),
        ));

        // Fresh challenge per attempt, so the nonce count is always 1.
        let authorization = build_authorization(credentials, challenge, &request, 1)?;
        request
            .headers
            .unique_push(rsip::Header::Authorization(authorization.into()));
        Ok(request)
    }

    async fn send_ack(
        &self,
        request: &rsip::Request,
        response: &rsip::Response,
        target: &Uri,
        seq: u32,
    ) -> Result<()> {
        let endpoint = self.endpoint().await?;
        let listener = self.listener().await?;

        let mut ack = rsip::Request {
            method: Method::Ack,
            uri: target.clone(),
            version: Version::default(),
            headers: rsip::Headers::default(),
            body: Vec::new(),
        };

        let mut via_addr: SipAddr = listener.into();
        via_addr.r#type = Some(Transport::Udp);
        let mut via = endpoint
            .inner
            .get_via(Some(via_addr), None)
            .map_err(Error::sip_stack)?;
        strip_rport_param(&mut via);
        ack.headers.unique_push(rsip::Header::Via(via.into()));
        ack.headers
            .unique_push(rsip::Header::MaxForwards(rsip::headers::MaxForwards::from(
                70u32,
            )));

        ack.headers
            .unique_push(rsip::Header::From(
                request
                    .from_header()
                    .map_err(Error::sip_stack)?
                    .clone(),
            ));
        // The answer's To header carries the peer's dialog tag.
        ack.headers.unique_push(rsip::Header::To(
            response.to_header().map_err(Error::sip_stack)?.clone(),
        ));
        ack.headers.unique_push(rsip::Header::CallId(
            request.call_id_header().map_err(Error::sip_stack)?.clone(),
        ));
        ack.headers.unique_push(rsip::Header::CSeq(
            typed::CSeq {
                seq,
                method: Method::Ack,
            }
            .into(),
        ));
        ack.headers.unique_push(rsip::Header::ContentLength(
            HeaderContentLength::from(0u32),
        ));

        let mut tx = self.start_client_transaction(ack).await?;
        tokio::spawn(async move { while tx.receive().await.is_some() {} });
        Ok(())
    }

    async fn send_bye(&self, dialog: &Dialog) {
        let bye = match self.prepare_bye(dialog).await {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "failed to build BYE");
                return;
            }
        };

        match self.start_client_transaction(bye).await {
            Ok(mut tx) => {
                tokio::spawn(async move { while tx.receive().await.is_some() {} });
            }
            Err(err) => warn!(error = %err, "failed to send BYE"),
        }
    }

    async fn prepare_bye(&self, dialog: &Dialog) -> Result<rsip::Request> {
        let endpoint = self.endpoint().await?;
        let listener = self.listener().await?;

        let mut request = rsip::Request {
            method: Method::Bye,
            uri: dialog.remote_target.clone(),
            version: Version::default(),
            headers: rsip::Headers::default(),
            body: Vec::new(),
        };

        let mut via_addr: SipAddr = listener.into();
        via_addr.r#type = Some(Transport::Udp);
        let mut via = endpoint
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

        let from_header = typed::From {
            display_name: None,
            uri: dialog.local_uri.clone(),
            params: vec![Param::Tag(dialog.local_tag.clone())],
        };
        request
            .headers
            .unique_push(rsip::Header::From(from_header.into()));

        let mut to_params = Vec::new();
        if let Some(tag) = dialog.remote_tag.clone() {
            to_params.push(Param::Tag(tag));
        }
        let to_header = typed::To {
            display_name: None,
            uri: dialog.remote_uri.clone(),
            params: to_params,
        };
        request.headers.unique_push(rsip::Header::To(to_header.into()));

        request.headers.unique_push(rsip::Header::CallId(HeaderCallId::from(
            dialog.call_id.clone(),
        )));
        request.headers.unique_push(rsip::Header::CSeq(
            typed::CSeq {
                seq: dialog.local_cseq + 1,
                method: Method::Bye,
            }
            .into(),
        ));
        request.headers.unique_push(rsip::Header::ContentLength(
            HeaderContentLength::from(0u32),
        ));

        Ok(request)
    }

    fn prepare_cancel(invite: &rsip::Request) -> Result<rsip::Request> {
        // Same Via branch and CSeq number as the INVITE, per RFC 3261 9.1.
        let mut cancel = invite.clone();
        cancel.method = Method::Cancel;
        cancel.body.clear();
        cancel.headers.unique_push(rsip::Header::ContentLength(
            HeaderContentLength::from(0u32),
        ));

        let seq = cancel
            .cseq_header()
            .map_err(Error::sip_stack)?
            .typed()
            .map_err(Error::sip_stack)?
            .seq;
        cancel.headers.unique_push(rsip::Header::CSeq(
            typed::CSeq {
                seq,
                method: Method::Cancel,
            }
            .into(),
        ));
        cancel.headers.retain(|header| {
            !matches!(
                header,
                rsip::Header::ContentType(_) | rsip::Header::Authorization(_)
            )
        });

        Ok(cancel)
    }

    async fn send_cancel(&self, invite: &rsip::Request) {
        let cancel = match Self::prepare_cancel(invite) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "failed to build CANCEL");
                return;
            }
        };

        match self.start_client_transaction(cancel).await {
            Ok(mut tx) => {
                tokio::spawn(async move { while tx.receive().await.is_some() {} });
            }
            Err(err) => warn!(error = %err, "failed to send CANCEL"),
        }
    }

    /// Response to an inbound request within (or establishing) our dialog:
    /// Via/From/Call-ID/CSeq mirrored from the request, To tagged with ours.
    fn dialog_response(
        request: &rsip::Request,
        status: StatusCode,
        local_tag: &Tag,
        contact: Option<String>,
        body: Option<Vec<u8>>,
    ) -> Result<rsip::Response> {
        let mut headers = rsip::Headers::default();
        for header in request.headers.iter() {
            match header {
                rsip::Header::Via(value) => headers.push(rsip::Header::Via(value.clone())),
                rsip::Header::RecordRoute(value) => {
                    headers.push(rsip::Header::RecordRoute(value.clone()))
                }
                rsip::Header::From(value) => headers.push(rsip::Header::From(value.clone())),
                rsip::Header::CallId(value) => headers.push(rsip::Header::CallId(value.clone())),
                rsip::Header::CSeq(value) => headers.push(rsip::Header::CSeq(value.clone())),
                _ => {}
            }
        }

        let mut to = request
            .to_header()
            .map_err(Error::sip_stack)?
            .typed()
            .map_err(Error::sip_stack)?;
        to.params.retain(|param| !matches!(param, Param::Tag(_)));
        to.params.push(Param::Tag(local_tag.clone()));
        headers.push(rsip::Header::To(to.into()));

        if let Some(contact) = contact {
            headers.push(rsip::Header::Contact(Contact::from(contact)));
        }

        let body = body.unwrap_or_default();
        if !body.is_empty() {
            headers.unique_push(rsip::Header::ContentType(ContentType::from(
                "application/sdp",
            )));
        }
        headers.unique_push(rsip::Header::ContentLength(HeaderContentLength::from(
            body.len() as u32,
        )));

        Ok(rsip::Response {
            status_code: status,
            version: Version::default(),
            headers,
            body,
        })
    }

    async fn local_offer(&self) -> Result<String> {
        let rtp = self.advertised_rtp().await?;
        let session_id = self.inner.session_counter.fetch_add(1, Ordering::SeqCst);
        Ok(build_local_offer(session_id, rtp.ip(), rtp.port()))
    }

    async fn start_client_transaction(&self, request: rsip::Request) -> Result<Transaction> {
        let endpoint = self.endpoint().await?;
        let key = TransactionKey::from_request(&request, TransactionRole::Client)
            .map_err(Error::sip_stack)?;
        let mut tx = Transaction::new_client(key, request, endpoint.inner.clone(), None);
        tx.destination = Some(self.server_target());
        tx.send().await.map_err(Error::sip_stack)?;
        Ok(tx)
    }

    fn server_target(&self) -> SipAddr {
        let mut target: SipAddr = self.inner.sip.server_socket_addr().into();
        target.r#type = Some(Transport::Udp);
        target
    }

    async fn endpoint(&self) -> Result<Arc<Endpoint>> {
        self.inner
            .endpoint
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::configuration("endpoint not initialized"))
    }

    async fn listener(&self) -> Result<SocketAddr> {
        self.inner
            .listener
            .read()
            .await
            .ok_or_else(|| Error::configuration("listener not initialized"))
    }

    async fn advertised_rtp(&self) -> Result<SocketAddr> {
        self.inner
            .advertised_rtp
            .read()
            .await
            .ok_or_else(|| Error::configuration("listener not initialized"))
    }

    async fn clear_call_slot(&self) {
        let mut slot = self.inner.call.write().await;
        *slot = CallSlot::Idle;
    }

    fn emit(&self, event: SipEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    fn is_transaction_already_terminated(err: &Error) -> bool {
        matches!(
            err,
            Error::SipStack(msg)
            if msg.contains("invalid state transition")
                && msg.contains("Terminated")
        )
    }

    /// RFC 3261 compact header names, rewritten to their long forms so the
    /// typed accessors see them.
    fn expand_compact_headers(headers: &mut rsip::Headers) {
        let mut collected: Vec<rsip::Header> = std::mem::take(headers).into();
        for header in collected.iter_mut() {
            let rsip::Header::Other(name, value) = header else {
                continue;
            };
            let value = value.to_string();
            *header = match name.to_ascii_lowercase().as_str() {
                "f" => rsip::Header::From(HeaderFrom::new(value)),
                "t" => rsip::Header::To(HeaderTo::new(value)),
                "i" => rsip::Header::CallId(HeaderCallId::new(value)),
                "m" => rsip::Header::Contact(Contact::new(value)),
                "v" => rsip::Header::Via(HeaderVia::new(value)),
                "l" => rsip::Header::ContentLength(HeaderContentLength::new(value)),
                "c" => rsip::Header::ContentType(ContentType::new(value)),
                "e" => rsip::Header::ContentEncoding(ContentEncoding::new(value)),
                "k" => rsip::Header::Supported(Supported::new(value)),
                "s" => rsip::Header::Subject(Subject::new(value)),
                _ => continue,
            };
        }
        *headers = collected.into();
    }
}

/// Prepare the SIP listener socket and wrap it for the transport layer.
/// Returns the connection plus the address to advertise in Via/Contact,
/// with unspecified bind addresses resolved to a routable one.
async fn create_udp_listener(
    bind: &crate::config::BindConfig,
    cancel_token: CancellationToken,
) -> Result<(UdpConnection, SocketAddr)> {
    let udp_socket = bind_udp_socket(bind, bind.port)?;
    let local_addr = udp_socket.local_addr()?;

    let advertised = if bind.address.is_unspecified() {
        SipConnection::resolve_bind_address(local_addr)
    } else {
        SocketAddr::new(bind.address, local_addr.port())
    };

    let mut sip_addr: SipAddr = advertised.into();
    sip_addr.r#type = Some(rsip::transport::Transport::Udp);

    let connection = UdpConnection::attach(
        UdpInner {
            conn: udp_socket,
            addr: sip_addr,
        },
        None,
        Some(cancel_token),
    )
    .await;

    Ok((connection, advertised))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite_fixture() -> rsip::Request {
        let mut request = rsip::Request {
            method: Method::Invite,
            uri: Uri::try_from("sip:doorbell@example.net").unwrap(),
            version: Version::default(),
            headers: rsip::Headers::default(),
            body: b"v=0\r\n".to_vec(),
        };
        request.headers.push(rsip::Header::Via(HeaderVia::new(
            "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bK776asdhds",
        )));
        request.headers.push(rsip::Header::From(HeaderFrom::new(
            "<sip:phone@example.net>;tag=1928301774",
        )));
        request
            .headers
            .push(rsip::Header::To(HeaderTo::new("<sip:doorbell@example.net>")));
        request
            .headers
            .push(rsip::Header::CallId(HeaderCallId::new("a84b4c76e66710")));
        request.headers.push(rsip::Header::CSeq(
            typed::CSeq {
                seq: 2,
                method: Method::Invite,
            }
            .into(),
        ));
        request.headers.push(rsip::Header::Contact(Contact::new(
            "<sip:phone@192.0.2.1:5060>",
        )));
        request
            .headers
            .push(rsip::Header::ContentType(ContentType::new("application/sdp")));
        request.headers.push(rsip::Header::ContentLength(
            HeaderContentLength::from(5u32),
        ));
        request
    }

    #[test]
    fn dialog_response_mirrors_request_and_tags_to() {
        let request = invite_fixture();
        let tag = Tag::default();

        let response =
            SipAgent::dialog_response(&request, StatusCode::Ringing, &tag, None, None).unwrap();

        assert_eq!(response.status_code, StatusCode::Ringing);
        assert!(response.body.is_empty());

        let to_tag = response
            .to_header()
            .unwrap()
            .tag()
            .unwrap()
            .expect("tag added");
        assert_eq!(to_tag, tag);

        let cseq = response.cseq_header().unwrap().typed().unwrap();
        assert_eq!(cseq.seq, 2);
        assert_eq!(cseq.method, Method::Invite);
        assert!(response.via_header().is_ok());
    }

    #[test]
    fn dialog_answer_carries_contact_and_sdp() {
        let request = invite_fixture();
        let tag = Tag::default();
        let body = b"v=0\r\n".to_vec();

        let response = SipAgent::dialog_response(
            &request,
            StatusCode::OK,
            &tag,
            Some("<sip:doorbell@198.51.100.2:5060>".into()),
            Some(body.clone()),
        )
        .unwrap();

        assert_eq!(response.body, body);
        assert!(response.contact_header().is_ok());
        let length = response
            .headers
            .iter()
            .find_map(|header| match header {
                rsip::Header::ContentLength(value) => Some(value.clone()),
                _ => None,
            })
            .expect("content length present");
        assert_eq!(length.value(), "5");
    }

    #[test]
    fn cancel_reuses_invite_identity_without_body() {
        let invite = invite_fixture();
        let cancel = SipAgent::prepare_cancel(&invite).unwrap();

        assert_eq!(cancel.method, Method::Cancel);
        assert!(cancel.body.is_empty());

        let cseq = cancel.cseq_header().unwrap().typed().unwrap();
        assert_eq!(cseq.seq, 2);
        assert_eq!(cseq.method, Method::Cancel);

        // Same transaction identity as the INVITE.
        assert_eq!(
            cancel.via_header().unwrap().value(),
            invite.via_header().unwrap().value()
        );
        assert_eq!(
            cancel.call_id_header().unwrap().value(),
            invite.call_id_header().unwrap().value()
        );
    }

    #[test]
    fn reauthorization_bumps_cseq_and_signs() {
        let invite = invite_fixture();
        let credentials = SipAuth {
            username: "doorbell".into(),
            password: "hunter2".into(),
        };
        let challenge = DigestChallenge {
            realm: "example.net".into(),
            nonce: "abc".into(),
            opaque: None,
            algorithm: None,
            qop: None,
        };

        let retried = SipAgent::reauthorize_invite(&invite, &credentials, &challenge).unwrap();

        let cseq = retried.cseq_header().unwrap().typed().unwrap();
        assert_eq!(cseq.seq, 3);
        assert!(
            retried
                .headers
                .iter()
                .any(|header| matches!(header, rsip::Header::Authorization(_)))
        );
    }

    #[test]
    fn compact_header_names_are_expanded() {
        let mut headers = rsip::Headers::default();
        headers.push(rsip::Header::Other("f".into(), "<sip:a@b>;tag=x".into()));
        headers.push(rsip::Header::Other("i".into(), "call-1".into()));
        headers.push(rsip::Header::Other("X-Custom".into(), "kept".into()));

        SipAgent::expand_compact_headers(&mut headers);

        assert!(
            headers
                .iter()
                .any(|header| matches!(header, rsip::Header::From(_)))
        );
        assert!(
            headers
                .iter()
                .any(|header| matches!(header, rsip::Header::CallId(_)))
        );
        assert!(headers.iter().any(
            |header| matches!(header, rsip::Header::Other(name, _) if name == "X-Custom")
        ));
    }
}

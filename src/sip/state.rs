use ftth_rsipstack::rsip;
use rsip::common::uri::param::Tag;
use rsip::{StatusCode, Uri};
use tokio_util::sync::CancellationToken;

use crate::sdp::RemoteMedia;

/// Call and registration signals surfaced to the bridge orchestrator.
#[derive(Debug, Clone)]
pub enum SipEvent {
    /// Registration with the SIP server was gained or lost.
    RegistrationChanged { registered: bool },
    /// The remote phone is ringing for a call the doorbell placed.
    RemoteRinging,
    /// A phone is calling the doorbell; the engine answers it itself.
    InboundCall,
    /// Both legs agreed on media; RTP may flow to `RemoteMedia`.
    CallEstablished(RemoteMedia),
    /// An attempted call did not reach the established state.
    CallFailed {
        status: Option<StatusCode>,
        reason: String,
    },
    /// An established call was torn down.
    CallEnded,
}

/// Dialog state for the single call the bridge handles at a time.
#[derive(Debug, Clone)]
pub(super) struct Dialog {
    pub(super) call_id: String,
    pub(super) local_uri: Uri,
    pub(super) remote_uri: Uri,
    pub(super) local_tag: Tag,
    pub(super) remote_tag: Option<Tag>,
    /// Request-URI for in-dialog requests, remote Contact when one was given.
    pub(super) remote_target: Uri,
    /// Highest CSeq this side has used within the dialog.
    pub(super) local_cseq: u32,
}

pub(super) enum CallSlot {
    Idle,
    /// Outbound INVITE in flight, no final response yet.
    Dialing(PendingOutbound),
    Established(Dialog),
}

pub(super) struct PendingOutbound {
    pub(super) call_id: String,
    pub(super) cancel: CancellationToken,
}

impl CallSlot {
    pub(super) fn is_idle(&self) -> bool {
        matches!(self, CallSlot::Idle)
    }

    pub(super) fn call_id(&self) -> Option<&str> {
        match self {
            CallSlot::Idle => None,
            CallSlot::Dialing(pending) => Some(&pending.call_id),
            CallSlot::Established(dialog) => Some(&dialog.call_id),
        }
    }
}

impl std::fmt::Debug for CallSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallSlot::Idle => f.write_str("Idle"),
            CallSlot::Dialing(pending) => f
                .debug_struct("Dialing")
                .field("call_id", &pending.call_id)
                .finish(),
            CallSlot::Established(dialog) => f
                .debug_struct("Established")
                .field("call_id", &dialog.call_id)
                .finish(),
        }
    }
}

//! Message definitions for the reconciliation session.
//!
//! ```text
//! test caller --SessionMsg--> ClientProxy --OutboundMsg--> server end
//!                                  ^                           |
//!                                  +--------InboundMsg---------+
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use super::ClientError;
use super::event::ViewEvent;

// =============================================================================
// Protocol Envelopes
// =============================================================================

/// Client -> server messages over the duplex channel.
#[derive(Debug)]
pub enum OutboundMsg {
    /// Join handshake for one view topic. The reply resolves with the
    /// initial rendered payload or a rejection reason.
    Join {
        topic: String,
        params: Value,
        reply: oneshot::Sender<Result<Value, String>>,
    },
    /// Correlated event push (`event`, `live_patch`, `cids_will_destroy`,
    /// `cids_destroyed`, ...).
    Event {
        topic: String,
        event: String,
        payload: Value,
        msg_ref: u64,
    },
    /// Leave a view topic; fire-and-forget.
    Leave { topic: String },
}

impl OutboundMsg {
    pub fn topic(&self) -> &str {
        match self {
            Self::Join { topic, .. } | Self::Event { topic, .. } | Self::Leave { topic } => topic,
        }
    }
}

/// Kind of server-driven navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectKind {
    /// Full redirect: the session terminates, as a browser would navigate away.
    Redirect,
    /// URL-only patch: the session records the new URL and continues.
    LivePatch,
    /// Live navigation to another view: terminates this session.
    LiveRedirect,
}

/// Server -> client messages over the duplex channel.
///
/// Serializes as a tagged JSON envelope so fixtures can script a server
/// from recorded wire traffic.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundMsg {
    /// Incremental diff for one view topic.
    Diff { topic: String, payload: Value },
    /// Reply correlated to an outstanding [`OutboundMsg::Event`]. The
    /// payload may carry a nested `diff` object.
    Reply {
        topic: String,
        #[serde(rename = "ref")]
        msg_ref: u64,
        payload: Value,
    },
    /// Server-driven navigation.
    Redirect {
        topic: String,
        kind: RedirectKind,
        to: String,
    },
    /// Terminal failure of a view or the whole channel.
    Close { topic: String, reason: String },
}

// =============================================================================
// Session Mailbox
// =============================================================================

/// Messages to the session actor from test callers.
pub enum SessionMsg {
    /// Fire a synthetic interaction and wait for the correlated reply.
    Interact {
        event: ViewEvent,
        selector: String,
        text_filter: Option<String>,
        value: Value,
        reply: oneshot::Sender<Result<String, ClientError>>,
    },
    /// Render the whole tracked document.
    Render {
        reply: oneshot::Sender<Result<String, ClientError>>,
    },
    /// Check element existence without pushing anything.
    HasElement {
        selector: String,
        text_filter: Option<String>,
        reply: oneshot::Sender<Result<bool, ClientError>>,
    },
    /// Current tracked page title.
    Title {
        reply: oneshot::Sender<Option<String>>,
    },
    /// Leave every view and stop the session.
    Stop { reply: oneshot::Sender<()> },
}

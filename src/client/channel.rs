//! In-memory duplex channel standing in for the socket transport.
//!
//! The real transport (connection lifecycle, heartbeat, rejoin) is an
//! external collaborator; the session only needs a duplex message pair.
//! Dropping the [`ServerChannel`] is the liveness signal: the session
//! observes closure and fails every pending request instead of hanging.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::messages::{InboundMsg, OutboundMsg, RedirectKind};

/// The far side of the channel went away.
#[derive(Debug, Error)]
#[error("transport channel closed")]
pub struct ChannelClosed;

/// Client half: consumed by [`super::ClientProxy`].
pub struct ClientChannel {
    pub(crate) outbound: mpsc::Sender<OutboundMsg>,
    pub(crate) inbound: mpsc::Receiver<InboundMsg>,
}

/// Server half: driven by view fixtures in tests.
pub struct ServerChannel {
    outbound: mpsc::Receiver<OutboundMsg>,
    inbound: mpsc::Sender<InboundMsg>,
}

/// Create a connected channel pair.
pub fn duplex(depth: usize) -> (ClientChannel, ServerChannel) {
    let (out_tx, out_rx) = mpsc::channel(depth);
    let (in_tx, in_rx) = mpsc::channel(depth);
    (
        ClientChannel {
            outbound: out_tx,
            inbound: in_rx,
        },
        ServerChannel {
            outbound: out_rx,
            inbound: in_tx,
        },
    )
}

impl ServerChannel {
    /// Next client push, or `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<OutboundMsg> {
        self.outbound.recv().await
    }

    pub async fn send(&self, msg: InboundMsg) -> Result<(), ChannelClosed> {
        self.inbound.send(msg).await.map_err(|_| ChannelClosed)
    }

    pub async fn send_diff(&self, topic: &str, payload: Value) -> Result<(), ChannelClosed> {
        self.send(InboundMsg::Diff {
            topic: topic.to_string(),
            payload,
        })
        .await
    }

    pub async fn send_reply(
        &self,
        topic: &str,
        msg_ref: u64,
        payload: Value,
    ) -> Result<(), ChannelClosed> {
        self.send(InboundMsg::Reply {
            topic: topic.to_string(),
            msg_ref,
            payload,
        })
        .await
    }

    pub async fn send_redirect(
        &self,
        topic: &str,
        kind: RedirectKind,
        to: &str,
    ) -> Result<(), ChannelClosed> {
        self.send(InboundMsg::Redirect {
            topic: topic.to_string(),
            kind,
            to: to.to_string(),
        })
        .await
    }

    pub async fn send_close(&self, topic: &str, reason: &str) -> Result<(), ChannelClosed> {
        self.send(InboundMsg::Close {
            topic: topic.to_string(),
            reason: reason.to_string(),
        })
        .await
    }
}

/// Perform a join round trip over an outbound sender.
pub(crate) async fn join(
    outbound: &mpsc::Sender<OutboundMsg>,
    topic: &str,
    params: Value,
) -> Result<Result<Value, String>, ChannelClosed> {
    let (tx, rx) = oneshot::channel();
    outbound
        .send(OutboundMsg::Join {
            topic: topic.to_string(),
            params,
            reply: tx,
        })
        .await
        .map_err(|_| ChannelClosed)?;
    rx.await.map_err(|_| ChannelClosed)
}

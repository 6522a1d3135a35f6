//! Reconciliation session (client proxy).
//!
//! A [`ClientProxy`] is the headless stand-in for a browser runtime: it owns
//! the live document, one [`RenderedTree`] accumulator per tracked view,
//! and a pending-reply table correlated by a per-session ref counter. The
//! proxy is a single-consumer actor — one inbound message is fully applied
//! (merge, render, patch, mount/unmount scan) before the next is taken, so
//! two views can never race on the shared document.
//!
//! Callers interact through a cloneable [`SessionHandle`]; replies travel
//! back over `oneshot` channels and never hang: server-channel closure,
//! view termination and redirects all fail pending requests with typed
//! errors.

pub mod channel;
pub mod event;
pub mod messages;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::diff::{DiffError, RenderedTree, RootDiff, merge::merge, render as diff_render};
use crate::dom::select::{Selector, SelectorError, select, select_one, text_content};
use crate::dom::{
    DiagnosticSink, Element, LogSink, Node, by_id, component_ids, parse::ParseError,
    parse::parse_fragment, render as dom_render, session_root_ids,
};
use crate::patch::{PatchError, patch};

use channel::{ChannelClosed, ClientChannel};
use event::{Interaction, ViewEvent};
use messages::{InboundMsg, OutboundMsg, RedirectKind, SessionMsg};

// =============================================================================
// Errors
// =============================================================================

/// Failures surfaced to session callers.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Transport(#[from] ChannelClosed),

    #[error("join for {topic} was rejected: {reason}")]
    JoinRejected { topic: String, reason: String },

    #[error("element has no {binding} binding (tag <{tag}>)")]
    NoEventBinding { binding: String, tag: String },

    #[error("element matched by {selector:?} belongs to no tracked view")]
    NoView { selector: String },

    #[error("view {topic} terminated: {reason}")]
    ViewTerminated { topic: String, reason: String },

    #[error("redirected to {to}")]
    Redirected { to: String },

    #[error("session terminated: {reason}")]
    SessionTerminated { reason: String },

    #[error("session is no longer running")]
    SessionClosed,

    #[error("timed out waiting for the session to reply")]
    Timeout,
}

impl ClientError {
    /// Configuration and protocol errors terminate the session; selector
    /// and binding errors stay local to one interaction.
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Diff(_) | Self::Patch(_) | Self::Parse(_) | Self::Transport(_)
        )
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Session tuning knobs.
pub struct SessionConfig {
    reply_timeout: Duration,
    mailbox_depth: usize,
    sink: Box<dyn DiagnosticSink>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(5),
            mailbox_depth: 32,
            sink: Box::new(LogSink),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a caller waits on a synthetic request before failing.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_mailbox_depth(mut self, depth: usize) -> Self {
        self.mailbox_depth = depth;
        self
    }

    /// Replace the duplicate-id/cid diagnostic sink.
    pub fn with_sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }
}

// =============================================================================
// Session State
// =============================================================================

fn topic_for(id: &str) -> String {
    format!("view:{id}")
}

/// Per-view tracking: diff accumulator plus tree ownership via the shared
/// document.
struct ViewState {
    topic: String,
    id: String,
    rendered: RenderedTree,
    /// Parent view topic; `None` for a root view.
    parent: Option<String>,
}

/// Outstanding correlated requests.
enum Pending {
    /// A caller waiting on a synthetic interaction.
    Interact {
        topic: String,
        selector: String,
        text_filter: Option<String>,
        reply: oneshot::Sender<Result<String, ClientError>>,
    },
    /// First phase of component eviction: awaiting `cids_will_destroy`.
    WillDestroy { topic: String, cids: Vec<i64> },
    /// Second phase: awaiting `cids_destroyed` confirmation.
    ConfirmDestroy { topic: String },
}

impl Pending {
    fn topic(&self) -> &str {
        match self {
            Self::Interact { topic, .. }
            | Self::WillDestroy { topic, .. }
            | Self::ConfirmDestroy { topic } => topic,
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable caller-side handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionMsg>,
    reply_timeout: Duration,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionMsg,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| ClientError::SessionClosed)?;
        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ClientError::SessionClosed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Fire a synthetic event at the selected element and wait for the
    /// patched inner markup of the target.
    pub async fn fire(
        &self,
        event: ViewEvent,
        selector: &str,
        text_filter: Option<&str>,
        value: Value,
    ) -> Result<String, ClientError> {
        self.request(|reply| SessionMsg::Interact {
            event,
            selector: selector.to_string(),
            text_filter: text_filter.map(str::to_string),
            value,
            reply,
        })
        .await?
    }

    pub async fn click(&self, selector: &str, text_filter: Option<&str>) -> Result<String, ClientError> {
        self.fire(ViewEvent::Click, selector, text_filter, json!({})).await
    }

    pub async fn submit(
        &self,
        selector: &str,
        text_filter: Option<&str>,
        values: Value,
    ) -> Result<String, ClientError> {
        self.fire(ViewEvent::Submit, selector, text_filter, values).await
    }

    pub async fn change(
        &self,
        selector: &str,
        text_filter: Option<&str>,
        values: Value,
    ) -> Result<String, ClientError> {
        self.fire(ViewEvent::Change, selector, text_filter, values).await
    }

    /// Render the whole tracked document.
    pub async fn render(&self) -> Result<String, ClientError> {
        self.request(|reply| SessionMsg::Render { reply }).await?
    }

    pub async fn has_element(
        &self,
        selector: &str,
        text_filter: Option<&str>,
    ) -> Result<bool, ClientError> {
        self.request(|reply| SessionMsg::HasElement {
            selector: selector.to_string(),
            text_filter: text_filter.map(str::to_string),
            reply,
        })
        .await?
    }

    /// The tracked page title, if any diff has set one.
    pub async fn title(&self) -> Result<Option<String>, ClientError> {
        self.request(|reply| SessionMsg::Title { reply }).await
    }

    /// Leave every view and stop the session.
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.request(|reply| SessionMsg::Stop { reply }).await
    }
}

// =============================================================================
// Proxy
// =============================================================================

enum Flow {
    Continue,
    Stop(String),
}

/// The reconciliation session actor.
pub struct ClientProxy {
    mailbox: mpsc::Receiver<SessionMsg>,
    inbound: mpsc::Receiver<InboundMsg>,
    outbound: mpsc::Sender<OutboundMsg>,
    document: Vec<Node>,
    views: FxHashMap<String, ViewState>,
    pending: FxHashMap<u64, Pending>,
    next_ref: u64,
    title: Option<String>,
    url: Option<String>,
    sink: Box<dyn DiagnosticSink>,
}

impl ClientProxy {
    /// Parse the initial page markup, join every live-session root found in
    /// it (outermost first, recursing into joined content), and return the
    /// proxy plus a caller handle. Spawn [`ClientProxy::run`] to serve it.
    pub async fn mount(
        channel: ClientChannel,
        html: &str,
    ) -> Result<(Self, SessionHandle), ClientError> {
        Self::mount_with(channel, html, SessionConfig::default()).await
    }

    pub async fn mount_with(
        channel: ClientChannel,
        html: &str,
        config: SessionConfig,
    ) -> Result<(Self, SessionHandle), ClientError> {
        let (tx, mailbox) = mpsc::channel(config.mailbox_depth);
        let document = parse_fragment(html)?;

        let mut proxy = Self {
            mailbox,
            inbound: channel.inbound,
            outbound: channel.outbound,
            document,
            views: FxHashMap::default(),
            pending: FxHashMap::default(),
            next_ref: 0,
            title: None,
            url: None,
            sink: config.sink,
        };
        proxy.mount_scan().await?;

        let handle = SessionHandle {
            tx,
            reply_timeout: config.reply_timeout,
        };
        Ok((proxy, handle))
    }

    /// Run the session event loop until stop, redirect, or failure.
    pub async fn run(mut self) {
        let reason = loop {
            tokio::select! {
                biased;
                inbound = self.inbound.recv() => match inbound {
                    Some(msg) => match self.handle_inbound(msg).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop(reason)) => break reason,
                        Err(e) => break e.to_string(),
                    },
                    None => break "server channel closed".to_string(),
                },
                request = self.mailbox.recv() => match request {
                    Some(SessionMsg::Stop { reply }) => {
                        self.leave_all().await;
                        let _ = reply.send(());
                        break "stopped".to_string();
                    }
                    Some(msg) => {
                        if let Err(e) = self.handle_request(msg).await {
                            break e.to_string();
                        }
                    }
                    None => {
                        self.leave_all().await;
                        break "all handles dropped".to_string();
                    }
                },
            }
        };

        self.leave_all().await;
        self.fail_pending(&reason);
        crate::debug!("client"; "session ended: {reason}");
    }

    // -------------------------------------------------------------------------
    // Inbound protocol messages
    // -------------------------------------------------------------------------

    async fn handle_inbound(&mut self, msg: InboundMsg) -> Result<Flow, ClientError> {
        match msg {
            InboundMsg::Diff { topic, payload } => {
                if !self.views.contains_key(&topic) {
                    crate::debug!("client"; "diff for untracked topic {topic}");
                    return Ok(Flow::Continue);
                }
                let diff = RootDiff::decode(&payload)?;
                self.apply_diff(&topic, diff).await?;
                Ok(Flow::Continue)
            }

            InboundMsg::Reply {
                topic,
                msg_ref,
                payload,
            } => {
                self.handle_reply(topic, msg_ref, payload).await?;
                Ok(Flow::Continue)
            }

            InboundMsg::Redirect { kind, to, .. } => match kind {
                RedirectKind::LivePatch => {
                    self.url = Some(to);
                    Ok(Flow::Continue)
                }
                RedirectKind::Redirect | RedirectKind::LiveRedirect => {
                    let target = to.clone();
                    self.fail_pending_with(|| ClientError::Redirected { to: target.clone() });
                    Ok(Flow::Stop(format!("redirected to {to}")))
                }
            },

            InboundMsg::Close { topic, reason } => {
                let is_child = self.views.get(&topic).is_some_and(|v| v.parent.is_some());
                if is_child {
                    self.unmount(&topic, &reason).await;
                    Ok(Flow::Continue)
                } else {
                    Ok(Flow::Stop(format!("view {topic} terminated: {reason}")))
                }
            }
        }
    }

    /// Merge, render and patch one diff for a tracked view, then rescan for
    /// mounted and unmounted children.
    async fn apply_diff(&mut self, topic: &str, diff: RootDiff) -> Result<(), ClientError> {
        if let Some(title) = &diff.title {
            self.title = Some(title.clone());
        }
        // An empty diff is a no-op: no render, no patch, no scans.
        if diff.node.is_empty() && diff.components.is_empty() {
            return Ok(());
        }

        let Some(mut view) = self.views.remove(topic) else {
            return Ok(());
        };
        merge(&mut view.rendered, diff)?;
        let destroyed = self.render_and_patch(&mut view)?;
        self.views.insert(topic.to_string(), view);

        self.sweep_unmounted().await;
        self.mount_scan().await?;
        self.confirm_will_destroy(topic, destroyed).await?;
        Ok(())
    }

    /// Render the view's accumulator and splice its inner content into the
    /// shared document.
    fn render_and_patch(&mut self, view: &mut ViewState) -> Result<Vec<i64>, ClientError> {
        let fragment = diff_render::to_fragment(&view.rendered)?;
        let streams = std::mem::take(&mut view.rendered.streams);

        // A view renders its own root element; what gets spliced is that
        // element's inner content.
        let inner = match by_id(&fragment, &view.id) {
            Some(el) => el.children.clone(),
            None => fragment,
        };

        let outcome = patch(
            &self.document,
            &view.id,
            inner,
            &streams,
            Some(self.sink.as_ref()),
        )?;
        self.document = outcome.document;
        Ok(outcome.destroyed_cids)
    }

    async fn handle_reply(
        &mut self,
        topic: String,
        msg_ref: u64,
        payload: Value,
    ) -> Result<(), ClientError> {
        let Some(pending) = self.pending.remove(&msg_ref) else {
            crate::debug!("client"; "reply {msg_ref} for {topic} matches no pending request");
            return Ok(());
        };

        match pending {
            Pending::Interact {
                topic: req_topic,
                selector,
                text_filter,
                reply,
            } => {
                let applied = match payload.get("diff") {
                    Some(value) => match RootDiff::decode(value) {
                        Ok(diff) => self.apply_diff(&req_topic, diff).await,
                        Err(e) => Err(e.into()),
                    },
                    None => Ok(()),
                };
                match applied {
                    Ok(()) => {
                        let markup =
                            self.target_markup(&req_topic, &selector, text_filter.as_deref());
                        let _ = reply.send(Ok(markup));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = reply.send(Err(ClientError::SessionTerminated {
                            reason: e.to_string(),
                        }));
                        Err(e)
                    }
                }
            }

            Pending::WillDestroy { topic, cids } => {
                // First pass was speculative against a since-superseded
                // tree; only cids still absent move to phase two.
                let Some(view_id) = self.views.get(&topic).map(|v| v.id.clone()) else {
                    return Ok(());
                };
                let live: FxHashSet<i64> = by_id(&self.document, &view_id)
                    .map(|el| component_ids(&el.children))
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                let gone: Vec<i64> = cids.into_iter().filter(|cid| !live.contains(cid)).collect();
                if !gone.is_empty() {
                    let msg_ref = self
                        .push_event(&topic, "cids_destroyed", json!({ "cids": gone }))
                        .await?;
                    self.pending.insert(msg_ref, Pending::ConfirmDestroy { topic });
                }
                Ok(())
            }

            Pending::ConfirmDestroy { topic } => {
                if let Some(view) = self.views.get_mut(&topic)
                    && let Some(cids) = payload.get("cids").and_then(Value::as_array)
                {
                    for cid in cids.iter().filter_map(Value::as_i64) {
                        view.rendered.components.remove(&cid);
                    }
                }
                Ok(())
            }
        }
    }

    /// Inner markup of the interaction target after the patch, falling back
    /// to the owning view when the target itself was patched away.
    fn target_markup(&self, topic: &str, selector: &str, filter: Option<&str>) -> String {
        if let Ok(el) = select_one(&self.document, selector, filter) {
            return dom_render::inner_markup(el);
        }
        self.views
            .get(topic)
            .and_then(|v| by_id(&self.document, &v.id))
            .map(dom_render::inner_markup)
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Caller requests
    // -------------------------------------------------------------------------

    async fn handle_request(&mut self, msg: SessionMsg) -> Result<(), ClientError> {
        match msg {
            SessionMsg::Interact {
                event,
                selector,
                text_filter,
                value,
                reply,
            } => {
                let started = self
                    .start_interaction(event, &selector, text_filter.as_deref(), &value)
                    .await;
                match started {
                    Ok((msg_ref, topic)) => {
                        self.pending.insert(
                            msg_ref,
                            Pending::Interact {
                                topic,
                                selector,
                                text_filter,
                                reply,
                            },
                        );
                        Ok(())
                    }
                    Err(e) if e.is_fatal() => {
                        let _ = reply.send(Err(ClientError::SessionTerminated {
                            reason: e.to_string(),
                        }));
                        Err(e)
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        Ok(())
                    }
                }
            }

            SessionMsg::Render { reply } => {
                let _ = reply.send(Ok(dom_render::to_markup(&self.document)));
                Ok(())
            }

            SessionMsg::HasElement {
                selector,
                text_filter,
                reply,
            } => {
                let result = Selector::parse(&selector)
                    .map(|sel| {
                        let matches = select(&self.document, &sel);
                        match text_filter.as_deref() {
                            None => !matches.is_empty(),
                            Some(f) => matches.iter().any(|el| text_content(el).contains(f)),
                        }
                    })
                    .map_err(ClientError::from);
                let _ = reply.send(result);
                Ok(())
            }

            SessionMsg::Title { reply } => {
                let _ = reply.send(self.title.clone());
                Ok(())
            }

            SessionMsg::Stop { .. } => unreachable!("stop is handled by the run loop"),
        }
    }

    async fn start_interaction(
        &mut self,
        event: ViewEvent,
        selector: &str,
        filter: Option<&str>,
        value: &Value,
    ) -> Result<(u64, String), ClientError> {
        let (topic, interaction) = {
            let target = select_one(&self.document, selector, filter)?;
            let topic = self
                .owning_topic(target)
                .ok_or_else(|| ClientError::NoView {
                    selector: selector.to_string(),
                })?;
            let interaction = event::prepare(event, &self.document, target, value)?;
            (topic, interaction)
        };

        match interaction {
            Interaction::Push { payload, .. } => {
                let msg_ref = self.push_event(&topic, "event", payload).await?;
                Ok((msg_ref, topic))
            }
            Interaction::LivePatch { href } => {
                self.url = Some(href.clone());
                let msg_ref = self
                    .push_event(&topic, "live_patch", json!({ "url": href }))
                    .await?;
                Ok((msg_ref, topic))
            }
            Interaction::Redirect { to } => Err(ClientError::Redirected { to }),
        }
    }

    /// Topic of the innermost tracked view containing the target.
    fn owning_topic(&self, target: &Element) -> Option<String> {
        session_path(&self.document, target)?
            .into_iter()
            .rev()
            .map(|id| topic_for(&id))
            .find(|topic| self.views.contains_key(topic))
    }

    async fn push_event(
        &mut self,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> Result<u64, ClientError> {
        self.next_ref += 1;
        let msg_ref = self.next_ref;
        self.outbound
            .send(OutboundMsg::Event {
                topic: topic.to_string(),
                event: event.to_string(),
                payload,
                msg_ref,
            })
            .await
            .map_err(|_| ChannelClosed)?;
        Ok(msg_ref)
    }

    // -------------------------------------------------------------------------
    // Mount / unmount scanning
    // -------------------------------------------------------------------------

    /// Join any live-session root not yet tracked, outermost first,
    /// repeating until the document is settled (joined content can itself
    /// contain further session roots).
    async fn mount_scan(&mut self) -> Result<(), ClientError> {
        loop {
            let next = session_root_ids(&self.document)
                .into_iter()
                .find(|id| !self.views.contains_key(&topic_for(id)));
            let Some(id) = next else { break };
            self.join_view(id).await?;
        }
        Ok(())
    }

    async fn join_view(&mut self, id: String) -> Result<(), ClientError> {
        let topic = topic_for(&id);
        let parent = self.parent_view_topic(&id);

        let reply = channel::join(&self.outbound, &topic, json!({})).await?;
        let payload = reply.map_err(|reason| ClientError::JoinRejected {
            topic: topic.clone(),
            reason,
        })?;
        // Join replies conventionally wrap the tree under "rendered".
        let rendered_value = payload.get("rendered").cloned().unwrap_or(payload);
        let diff = RootDiff::decode(&rendered_value)?;
        if let Some(title) = &diff.title {
            self.title = Some(title.clone());
        }

        let mut view = ViewState {
            topic: topic.clone(),
            id,
            rendered: RenderedTree::default(),
            parent,
        };
        merge(&mut view.rendered, diff)?;
        let destroyed = self.render_and_patch(&mut view)?;
        self.views.insert(topic.clone(), view);
        self.confirm_will_destroy(&topic, destroyed).await?;
        Ok(())
    }

    /// Topic of the nearest tracked ancestor session root of element `id`.
    fn parent_view_topic(&self, id: &str) -> Option<String> {
        let target = by_id(&self.document, id)?;
        let path = session_path(&self.document, target)?;
        path.into_iter()
            .rev()
            .map(|root_id| topic_for(&root_id))
            .find(|topic| self.views.contains_key(topic))
    }

    /// Unmount every tracked view whose session marker left the document.
    async fn sweep_unmounted(&mut self) {
        let vanished: Vec<String> = {
            let document = &self.document;
            self.views
                .values()
                .filter(|view| !id_is_live(document, &view.id))
                .map(|view| view.topic.clone())
                .collect()
        };
        for topic in vanished {
            if self.views.contains_key(&topic) {
                self.unmount(&topic, "removed from the page").await;
            }
        }
    }

    /// Unmount a view: nested children first, then the leave call, then
    /// bookkeeping eviction. Pending requests for the topic fail rather
    /// than hang.
    fn unmount<'a>(
        &'a mut self,
        topic: &'a str,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let children: Vec<String> = self
                .views
                .values()
                .filter(|view| view.parent.as_deref() == Some(topic))
                .map(|view| view.topic.clone())
                .collect();
            for child in children {
                self.unmount(&child, reason).await;
            }

            if self.views.remove(topic).is_some() {
                let _ = self
                    .outbound
                    .send(OutboundMsg::Leave {
                        topic: topic.to_string(),
                    })
                    .await;
                self.fail_topic_pending(topic, reason);
            }
        })
    }

    async fn leave_all(&mut self) {
        let roots: Vec<String> = self
            .views
            .values()
            .filter(|view| view.parent.is_none())
            .map(|view| view.topic.clone())
            .collect();
        for topic in roots {
            self.unmount(&topic, "session stopped").await;
        }
        // Orphans with a broken parent chain still get their leave.
        let rest: Vec<String> = self.views.keys().cloned().collect();
        for topic in rest {
            self.unmount(&topic, "session stopped").await;
        }
    }

    // -------------------------------------------------------------------------
    // Component eviction handshake
    // -------------------------------------------------------------------------

    /// Phase one of the destroy handshake for cids the patch reported gone.
    async fn confirm_will_destroy(
        &mut self,
        topic: &str,
        cids: Vec<i64>,
    ) -> Result<(), ClientError> {
        if cids.is_empty() {
            return Ok(());
        }
        let msg_ref = self
            .push_event(topic, "cids_will_destroy", json!({ "cids": &cids }))
            .await?;
        self.pending.insert(
            msg_ref,
            Pending::WillDestroy {
                topic: topic.to_string(),
                cids,
            },
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pending bookkeeping
    // -------------------------------------------------------------------------

    fn fail_topic_pending(&mut self, topic: &str, reason: &str) {
        let refs: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.topic() == topic)
            .map(|(msg_ref, _)| *msg_ref)
            .collect();
        for msg_ref in refs {
            if let Some(Pending::Interact { reply, .. }) = self.pending.remove(&msg_ref) {
                let _ = reply.send(Err(ClientError::ViewTerminated {
                    topic: topic.to_string(),
                    reason: reason.to_string(),
                }));
            }
        }
    }

    fn fail_pending_with(&mut self, make: impl Fn() -> ClientError) {
        for (_, pending) in self.pending.drain() {
            if let Pending::Interact { reply, .. } = pending {
                let _ = reply.send(Err(make()));
            }
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        let reason = reason.to_string();
        self.fail_pending_with(|| ClientError::SessionTerminated {
            reason: reason.clone(),
        });
    }

    /// The URL most recently set by a live patch, if any.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}

// =============================================================================
// Document helpers
// =============================================================================

fn id_is_live(document: &[Node], id: &str) -> bool {
    by_id(document, id).is_some_and(Element::is_session_root)
}

/// Ids of session roots on the path to `target`, outermost first, with the
/// target itself included when it is a root. `None` if the target is not in
/// the document.
fn session_path(nodes: &[Node], target: &Element) -> Option<Vec<String>> {
    fn walk<'a>(
        nodes: &'a [Node],
        target: &Element,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        for node in nodes {
            let Some(el) = node.as_element() else { continue };
            let mut pushed = false;
            if el.is_session_root()
                && let Some(id) = el.id()
            {
                stack.push(id.to_string());
                pushed = true;
            }
            if std::ptr::eq(el, target) {
                return Some(stack.clone());
            }
            if let Some(found) = walk(&el.children, target, stack) {
                return Some(found);
            }
            if pushed {
                stack.pop();
            }
        }
        None
    }
    walk(nodes, target, &mut Vec::new())
}

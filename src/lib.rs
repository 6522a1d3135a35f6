//! wraith - headless client harness for socket-driven server-rendered views.
//!
//! Simulates a browser's half of a stateful view protocol so view servers
//! can be exercised with plain assertions instead of a real browser:
//!
//! ```text
//! fixture server --diff/reply--> ClientProxy --merge+render+patch--> document
//!                                    ^                                  |
//!                                    +---------SessionHandle------------+
//! ```
//!
//! # Module Structure
//!
//! - `dom` - tree model: parsing, serialization, selection, traversal
//! - `diff` - wire diff decoding, the merge engine, the tree renderer
//! - `patch` - stateful tree patcher with per-container update strategies
//! - `client` - the reconciliation session actor and its duplex channel
//! - `logger` - `log!`/`debug!` macros with colored prefixes

pub mod client;
pub mod diff;
pub mod dom;
pub mod logger;
pub mod patch;

pub use client::channel::{ChannelClosed, ClientChannel, ServerChannel, duplex};
pub use client::event::ViewEvent;
pub use client::messages::{InboundMsg, OutboundMsg, RedirectKind};
pub use client::{ClientError, ClientProxy, SessionConfig, SessionHandle};
pub use diff::{DiffError, Rendered, RenderedTree, RootDiff, StreamInsert, StreamOp};
pub use dom::select::{Selector, SelectorError};
pub use dom::{Attrs, DiagnosticSink, Element, Node};
pub use patch::{PatchError, PatchOutcome, patch};

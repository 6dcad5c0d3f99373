//! Protocol translation for the upstream chat backend
//!
//! Builds the upstream's tree-shaped conversation payload from role-tagged
//! turns and parses its event stream back into plain text deltas. The
//! translator is stateless: every call gets a fresh conversation id.

pub mod client;
pub mod error;
pub mod message;
pub mod payload;
pub mod sse;

pub use client::{BROWSER_USER_AGENT, ChatUpstream, ZaiClient};
pub use error::{Result, UpstreamError};
pub use message::{Role, Turn, UpstreamRole};
pub use payload::{ChatPayload, Node, UpstreamRequest, build_request};
pub use sse::{DONE_SENTINEL, DeltaStream, Frame, delta_stream, parse_line};

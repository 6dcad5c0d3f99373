//! Upstream event-stream parsing
//!
//! The upstream streams newline-delimited `data:` lines carrying JSON frames
//! and ends with a literal `[DONE]` line. Only the delta text is extracted;
//! lines that are not data, frames without text, and frames that fail to
//! parse are skipped so a single bad frame never fails the stream.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt as _, try_unfold};
use serde_json::Value;
use tracing::trace;

use crate::error::{Result, UpstreamError};

/// Stream terminator payload.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Frame fields that may carry delta text, in lookup order.
const DELTA_FIELDS: [&str; 3] = ["content", "token", "delta_content"];

/// Lazy sequence of upstream text deltas.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Parsed meaning of one stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Delta(String),
    Done,
    Skip,
}

/// Classify a single line of the event stream.
pub fn parse_line(line: &str) -> Frame {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(data) = line.strip_prefix("data:") else {
        return Frame::Skip;
    };
    let data = data.trim();
    if data == DONE_SENTINEL {
        return Frame::Done;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(value) => delta_text(&value)
            .map_or(Frame::Skip, |text| Frame::Delta(text.to_string())),
        Err(e) => {
            trace!(error = %e, "dropping malformed frame");
            Frame::Skip
        }
    }
}

/// Delta text of a frame, looking one level into a nested `data` object.
fn delta_text(value: &Value) -> Option<&str> {
    DELTA_FIELDS
        .iter()
        .find_map(|field| {
            value
                .get(field)
                .and_then(Value::as_str)
                .filter(|text| !text.is_empty())
        })
        .or_else(|| {
            let nested = value.get("data")?;
            DELTA_FIELDS.iter().find_map(|field| {
                nested
                    .get(field)
                    .and_then(Value::as_str)
                    .filter(|text| !text.is_empty())
            })
        })
}

/// Turn a raw byte stream into a stream of delta texts.
///
/// Ends at `[DONE]` or end of body. A transport error is yielded once and
/// ends the stream. Dropping the returned stream drops the byte stream, which
/// closes the upstream connection.
pub fn delta_stream<S, E>(bytes: S) -> DeltaStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    struct State<S> {
        inner: Pin<Box<S>>,
        buf: Vec<u8>,
    }

    Box::pin(try_unfold(
        State {
            inner: Box::pin(bytes),
            buf: Vec::new(),
        },
        |mut s| async move {
            loop {
                if let Some(nl) = s.buf.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = s.buf.drain(..=nl).collect();
                    match parse_line(&String::from_utf8_lossy(&raw)) {
                        Frame::Delta(text) => return Ok(Some((text, s))),
                        Frame::Done => return Ok(None),
                        Frame::Skip => continue,
                    }
                }

                match s.inner.next().await {
                    Some(Ok(chunk)) => s.buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Err(UpstreamError::Transport(e.to_string())),
                    None => {
                        // Final line without a trailing newline
                        let raw = std::mem::take(&mut s.buf);
                        return match parse_line(&String::from_utf8_lossy(&raw)) {
                            Frame::Delta(text) => Ok(Some((text, s))),
                            Frame::Done | Frame::Skip => Ok(None),
                        };
                    }
                }
            }
        },
    ))
}

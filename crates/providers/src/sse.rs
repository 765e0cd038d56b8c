//! SSE plumbing shared by streaming adapters.
//!
//! Chat completion streams arrive as `text/event-stream` bodies: events
//! separated by blank lines, payloads on `data:` lines. The response body is
//! buffered chunk by chunk; complete events are drained and handed to a
//! provider-specific parser that yields zero or more [`StreamEvent`]s per
//! payload.

use sp_domain::error::{Error, Result};
use sp_domain::stream::{BoxStream, StreamEvent};

/// Map a reqwest error onto the shared error type.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Pull complete `data:` payloads out of the buffer, leaving any trailing
/// partial event in place for the next chunk.
pub(crate) fn drain_sse_payloads(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let event: String = buffer.drain(..pos + 2).collect();
        for line in event.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
    }

    payloads
}

/// Turn an SSE `reqwest::Response` into a [`BoxStream`] of stream events.
///
/// Guarantees a trailing `Done` even when the provider closes the body
/// without sending one, so consumers never hang on a missing terminator.
pub(crate) fn sse_event_stream<F>(
    response: reqwest::Response,
    mut parse_payload: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut saw_done = false;

        loop {
            let chunk = match response.chunk().await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            for payload in drain_sse_payloads(&mut buffer) {
                for event in parse_payload(&payload) {
                    saw_done |= matches!(&event, Ok(StreamEvent::Done { .. }));
                    yield event;
                }
            }
        }

        // Flush a trailing partial event left without its blank-line delimiter.
        if !buffer.trim().is_empty() {
            buffer.push_str("\n\n");
            for payload in drain_sse_payloads(&mut buffer) {
                for event in parse_payload(&payload) {
                    saw_done |= matches!(&event, Ok(StreamEvent::Done { .. }));
                    yield event;
                }
            }
        }

        if !saw_done {
            yield Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) });
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_event() {
        let mut buf = String::from("event: chunk\ndata: {\"a\":1}\n\n");
        assert_eq!(drain_sse_payloads(&mut buf), vec!["{\"a\":1}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_event_waits_for_more() {
        let mut buf = String::from("data: done\n\ndata: half");
        assert_eq!(drain_sse_payloads(&mut buf), vec!["done"]);
        assert_eq!(buf, "data: half");

        buf.push_str("-rest\n\n");
        assert_eq!(drain_sse_payloads(&mut buf), vec!["half-rest"]);
    }

    #[test]
    fn ignores_comment_and_meta_lines() {
        let mut buf = String::from(": keepalive\nid: 7\nretry: 100\ndata: x\n\n");
        assert_eq!(drain_sse_payloads(&mut buf), vec!["x"]);
    }

    #[test]
    fn empty_data_is_dropped() {
        let mut buf = String::from("data:\n\ndata:   \n\n");
        assert!(drain_sse_payloads(&mut buf).is_empty());
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut buf = String::from("data: one\n\ndata: two\n\ndata: [DONE]\n\n");
        assert_eq!(drain_sse_payloads(&mut buf), vec!["one", "two", "[DONE]"]);
    }
}

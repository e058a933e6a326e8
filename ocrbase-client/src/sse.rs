//! Minimal server-sent-event decoder over a `reqwest` byte stream.
//!
//! The Realtime Gateway's SSE transport (ocrbase-api's
//! `handlers::realtime::sse`) only ever needs `event:`/`data:` fields plus
//! bare `:`-prefixed comments for keepalive — this decoder handles exactly
//! that subset, not the full EventSource grammar (no `id:`/`retry:`
//! reconnection-id tracking; the waiter reconnects by re-subscribing from
//! scratch).

use futures_util::{Stream, StreamExt};

use crate::error::ClientError;

/// One decoded SSE dispatch: the `event:` field (defaults to `"message"`
/// when absent, per the spec) and the concatenated `data:` lines.
#[derive(Debug)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
}

/// Buffers a byte stream and yields complete SSE messages, split on the
/// blank line that terminates every dispatch.
pub struct SseDecoder<S> {
    inner: S,
    buffer: String,
}

impl<S> SseDecoder<S>
where
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: String::new(),
        }
    }

    /// Returns the next decoded message, pulling more bytes from the
    /// underlying stream as needed. `Ok(None)` means the stream ended
    /// cleanly (connection closed) without a pending message.
    pub async fn next_message(&mut self) -> Result<Option<SseMessage>, ClientError> {
        loop {
            if let Some(message) = self.try_take_message() {
                return Ok(Some(message));
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                Some(Err(error)) => return Err(ClientError::Transport(error)),
                None => {
                    return Ok(self.try_take_message());
                }
            }
        }
    }

    /// Pulls one complete `\n\n`-terminated block out of the buffer, if any,
    /// and parses it into an `SseMessage`. Pure comment blocks (keepalive)
    /// are consumed and skipped transparently.
    fn try_take_message(&mut self) -> Option<SseMessage> {
        loop {
            let boundary = self.buffer.find("\n\n")?;
            let block = self.buffer[..boundary].to_owned();
            self.buffer.drain(..boundary + 2);

            if let Some(message) = parse_block(&block) {
                return Some(message);
            }
            // block was comments-only (keepalive); keep draining.
        }
    }
}

fn parse_block(block: &str) -> Option<SseMessage> {
    let mut event = String::from("message");
    let mut data_lines = Vec::new();

    for line in block.lines() {
        if line.starts_with(':') || line.is_empty() {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim().to_owned());
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseMessage {
        event,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn decoder_for(chunks: Vec<&'static str>) -> SseDecoder<impl Stream<Item = Result<bytes::Bytes, reqwest::Error>>> {
        let items = chunks
            .into_iter()
            .map(|c| Ok::<_, reqwest::Error>(bytes::Bytes::from(c)))
            .collect::<Vec<_>>();
        SseDecoder::new(stream::iter(items))
    }

    #[tokio::test]
    async fn decodes_a_single_message_delivered_whole() {
        let mut decoder = decoder_for(vec!["event: status\ndata: {\"a\":1}\n\n"]);
        let message = decoder.next_message().await.unwrap().unwrap();
        assert_eq!(message.event, "status");
        assert_eq!(message.data, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn decodes_a_message_split_across_chunks() {
        let mut decoder = decoder_for(vec!["event: sta", "tus\ndata: {\"a\":1}", "\n\n"]);
        let message = decoder.next_message().await.unwrap().unwrap();
        assert_eq!(message.event, "status");
        assert_eq!(message.data, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn skips_keepalive_comments() {
        let mut decoder = decoder_for(vec![": keepalive\n\n", "event: pong\ndata: {}\n\n"]);
        let message = decoder.next_message().await.unwrap().unwrap();
        assert_eq!(message.event, "pong");
    }

    #[tokio::test]
    async fn end_of_stream_with_no_pending_message_is_none() {
        let mut decoder = decoder_for(vec![": keepalive\n\n"]);
        let message = decoder.next_message().await.unwrap();
        assert!(message.is_none());
    }
}

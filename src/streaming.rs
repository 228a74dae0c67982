//! Streaming helpers.
//!
//! A [`TextStream`] yields text chunks in arrival order. This module also
//! holds the progress decorator, cooperative cancellation and the buffered
//! Server-Sent Events decoder used by HTTP providers.

use crate::error::ProviderError;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// A boxed stream of text chunks.
///
/// Dropping the stream releases whatever transport backs it.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Wraps `stream` so that `on_progress` sees every chunk before the caller.
///
/// Chunks are passed through unchanged and unbuffered; errors are forwarded
/// without invoking the callback.
pub fn with_progress<F>(stream: TextStream, mut on_progress: F) -> TextStream
where
    F: FnMut(&str) + Send + 'static,
{
    Box::pin(stream.inspect(move |item| {
        if let Ok(chunk) = item {
            on_progress(chunk);
        }
    }))
}

/// Drains a stream into one string, stopping at the first error.
///
/// # Errors
///
/// Returns the first error yielded by the stream.
pub async fn collect_text(mut stream: TextStream) -> Result<String, ProviderError> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        text.push_str(&chunk?);
    }
    Ok(text)
}

/// A handle that stops a stream created by [`cancellable`].
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Requests cancellation.
    ///
    /// The wrapped stream ends at its next poll and drops the inner stream,
    /// which closes the underlying connection.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Makes `stream` cancellable and returns it with its handle.
pub fn cancellable(stream: TextStream) -> (TextStream, CancelHandle) {
    let handle = CancelHandle::default();
    let token = handle.token.clone();
    let mut inner = stream;

    let wrapped = async_stream::stream! {
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    tracing::debug!("stream cancelled");
                    break;
                }
                item = inner.next() => {
                    let Some(item) = item else { break };
                    yield item;
                }
            }
        }
    };

    (Box::pin(wrapped), handle)
}

/// A parsed Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field
    pub event: Option<String>,
    /// Joined `data:` lines
    pub data: String,
}

/// Buffered SSE decoder.
///
/// Network chunks may split an event, or a multi-byte character, at any
/// byte. The decoder keeps the unfinished tail and only emits events whose
/// terminating blank line has arrived.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending_utf8: Vec<u8>,
}

impl SseDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every event completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut bytes = std::mem::take(&mut self.pending_utf8);
        bytes.extend_from_slice(chunk);

        match std::str::from_utf8(&bytes) {
            Ok(text) => self.buffer.push_str(text),
            Err(e) if e.error_len().is_none() => {
                let (valid, tail) = bytes.split_at(e.valid_up_to());
                self.buffer.push_str(&String::from_utf8_lossy(valid));
                self.pending_utf8 = tail.to_vec();
            }
            Err(e) => {
                tracing::warn!(position = e.valid_up_to(), "invalid UTF-8 in event stream");
                self.buffer.push_str(&String::from_utf8_lossy(&bytes));
            }
        }

        let mut events = Vec::new();
        while let Some((end, delimiter)) = self.next_boundary() {
            let block: String = self.buffer.drain(..end + delimiter).collect();
            if let Some(event) = parse_event(&block[..end]) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes an unterminated trailing event, if any.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.pending_utf8.clear();
        let rest = std::mem::take(&mut self.buffer);
        parse_event(&rest)
    }

    /// Returns true if partial data is buffered.
    #[must_use]
    pub fn has_remaining(&self) -> bool {
        !self.buffer.trim().is_empty() || !self.pending_utf8.is_empty()
    }

    fn next_boundary(&self) -> Option<(usize, usize)> {
        let lf = self.buffer.find("\n\n").map(|pos| (pos, 2));
        let crlf = self.buffer.find("\r\n\r\n").map(|pos| (pos, 4));
        match (lf, crlf) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        }
    }
}

fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data = Vec::new();

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if data.is_empty() {
        return None;
    }

    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::{Arc, Mutex};

    fn chunks(items: &[&str]) -> TextStream {
        let items: Vec<Result<String, ProviderError>> =
            items.iter().map(|s| Ok((*s).to_string())).collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn progress_sees_each_chunk_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let stream = with_progress(chunks(&["a", "b"]), move |chunk| {
            sink.lock().unwrap().push(chunk.to_string());
        });
        let text = collect_text(stream).await.unwrap();

        assert_eq!(text, "ab");
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn progress_skips_errors() {
        let items = vec![Ok("a".to_string()), Err(ProviderError::stream("cut"))];
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);

        let mut stream = with_progress(Box::pin(stream::iter(items)), move |_| {
            *counter.lock().unwrap() += 1;
        });

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert!(stream.next().await.unwrap().is_err());
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn collect_stops_at_first_error() {
        let items = vec![
            Ok("a".to_string()),
            Err(ProviderError::stream("cut")),
            Ok("b".to_string()),
        ];
        let err = collect_text(Box::pin(stream::iter(items))).await.unwrap_err();
        assert_eq!(err.message(), "cut");
    }

    #[tokio::test]
    async fn cancel_ends_stream() {
        let pending = stream::pending::<Result<String, ProviderError>>();
        let (mut stream, handle) = cancellable(Box::pin(pending));
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn uncancelled_stream_passes_through() {
        let (stream, handle) = cancellable(chunks(&["x", "y"]));
        assert_eq!(collect_text(stream).await.unwrap(), "xy");
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn decoder_parses_complete_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event: ping\ndata: {\"a\":1}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("ping".to_string()),
                data: "{\"a\":1}".to_string(),
            }]
        );
        assert!(!decoder.has_remaining());
    }

    #[test]
    fn decoder_buffers_split_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: delta\nda").is_empty());
        assert!(decoder.has_remaining());

        let events = decoder.feed(b"ta: hello\n\ndata: next\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[1].event, None);
    }

    #[test]
    fn decoder_handles_split_multibyte_character() {
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        let split = bytes.len() - 3;

        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(&bytes[..split]).is_empty());
        let events = decoder.feed(&bytes[split..]);

        assert_eq!(events[0].data, "caf\u{e9}");
    }

    #[test]
    fn decoder_joins_data_lines_and_ignores_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keep-alive\ndata: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn decoder_accepts_crlf_delimiters() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event: a\r\ndata: 1\r\n\r\n");
        assert_eq!(events[0].event.as_deref(), Some("a"));
        assert_eq!(events[0].data, "1");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: tail").is_empty());
        assert_eq!(decoder.finish().map(|e| e.data), Some("tail".to_string()));
        assert!(!decoder.has_remaining());
    }
}

//! Incremental response decoding.
//!
//! Backends deliver streamed output as raw byte chunks whose boundaries are
//! arbitrary: a chunk may end mid-line or even mid-UTF-8 sequence. The
//! decoders here buffer partial input and only hand out complete frames.
//!
//! - [`LineBuffer`]: newline-delimited frames (Ollama ndjson)
//! - [`SseDecoder`]: Server-Sent Events (`event:` / `data:` blocks)
//! - [`fragment_stream`]: drives a decoder over a byte stream and yields text
//!   fragments until the backend signals completion

use std::collections::VecDeque;

use futures::{Stream, StreamExt};

use super::FragmentStream;
use crate::types::{Result, RouterError};

// =============================================================================
// Line Buffer
// =============================================================================

/// Splits a byte stream into complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every line completed by them (without `\r\n`)
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Remaining unterminated line at end of input
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string())
    }
}

// =============================================================================
// SSE Decoder
// =============================================================================

/// One dispatched Server-Sent Event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the last `event:` field, if any
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
}

/// Assembles SSE events from raw bytes
#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: LineBuffer,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        let lines = self.lines.push(bytes);
        let mut events = Vec::new();
        for line in lines {
            if let Some(event) = self.feed_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush the trailing event when the stream ends without a blank line
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if let Some(line) = self.lines.finish()
            && let Some(event) = self.feed_line(&line)
        {
            events.push(event);
        }
        if let Some(event) = self.dispatch() {
            events.push(event);
        }
        events
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data })
    }
}

// =============================================================================
// Fragment Stream
// =============================================================================

/// Outcome of parsing one decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Generated text
    Text(String),
    /// Backend signalled completion
    Done,
    /// Metadata or keep-alive
    Ignore,
}

/// Drive `split` over the byte stream and map each frame through `parse`.
///
/// `split(Some(bytes))` returns frames completed by a chunk; `split(None)`
/// flushes at end of input. Transport errors end the stream with
/// `StreamInterrupted`; a parse error ends it with that error.
pub fn fragment_stream<S, B, T, Sp, Pa>(
    bytes: S,
    provider: impl Into<String>,
    split: Sp,
    parse: Pa,
) -> FragmentStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    T: Send + 'static,
    Sp: FnMut(Option<&[u8]>) -> Vec<T> + Send + 'static,
    Pa: FnMut(T) -> Result<Frame> + Send + 'static,
{
    struct State<S, T, Sp, Pa> {
        bytes: std::pin::Pin<Box<S>>,
        split: Sp,
        parse: Pa,
        queue: VecDeque<T>,
        input_ended: bool,
        finished: bool,
        provider: String,
    }

    let state = State {
        bytes: Box::pin(bytes),
        split,
        parse,
        queue: VecDeque::new(),
        input_ended: false,
        finished: false,
        provider: provider.into(),
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            while let Some(frame) = state.queue.pop_front() {
                match (state.parse)(frame) {
                    Ok(Frame::Text(text)) if !text.is_empty() => {
                        return Some((Ok(text), state));
                    }
                    Ok(Frame::Text(_)) | Ok(Frame::Ignore) => continue,
                    Ok(Frame::Done) => {
                        state.finished = true;
                        return None;
                    }
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }

            if state.input_ended {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let frames = (state.split)(Some(chunk.as_ref()));
                    state.queue.extend(frames);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    let err = RouterError::StreamInterrupted {
                        provider: state.provider.clone(),
                        reason: e.to_string(),
                    };
                    return Some((Err(err), state));
                }
                None => {
                    state.input_ended = true;
                    let frames = (state.split)(None);
                    state.queue.extend(frames);
                }
            }
        }
    });

    Box::pin(stream)
}

/// Fragment stream over newline-delimited frames
pub fn line_fragment_stream<S, B, Pa>(bytes: S, provider: impl Into<String>, parse: Pa) -> FragmentStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    Pa: FnMut(String) -> Result<Frame> + Send + 'static,
{
    let mut lines = LineBuffer::new();
    fragment_stream(
        bytes,
        provider,
        move |chunk| match chunk {
            Some(bytes) => lines.push(bytes),
            None => lines.finish().into_iter().collect(),
        },
        parse,
    )
}

/// Fragment stream over Server-Sent Events
pub fn sse_fragment_stream<S, B, Pa>(bytes: S, provider: impl Into<String>, parse: Pa) -> FragmentStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    Pa: FnMut(SseEvent) -> Result<Frame> + Send + 'static,
{
    let mut decoder = SseDecoder::new();
    fragment_stream(
        bytes,
        provider,
        move |chunk| match chunk {
            Some(bytes) => decoder.push(bytes),
            None => decoder.finish(),
        },
        parse,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = reqwest::Result<Vec<u8>>> + Send + 'static {
        let owned: Vec<reqwest::Result<Vec<u8>>> = parts.iter().map(|p| Ok(p.to_vec())).collect();
        futures::stream::iter(owned)
    }

    #[test]
    fn test_line_buffer_joins_split_lines() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.push(b"1}\r\n{\"b\""), vec!["{\"a\":1}"]);
        assert_eq!(buf.finish().as_deref(), Some("{\"b\""));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_line_buffer_handles_split_utf8() {
        let bytes = "señal\n".as_bytes();
        let mut buf = LineBuffer::new();
        // Split inside the two-byte 'ñ'
        assert!(buf.push(&bytes[..3]).is_empty());
        assert_eq!(buf.push(&bytes[3..]), vec!["señal"]);
    }

    #[test]
    fn test_sse_decoder_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(
            b"event: content_block_delta\ndata: {\"x\":1}\n\n: keep-alive\n\ndata: [DONE]\n\n",
        );
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: Some("content_block_delta".to_string()),
                    data: "{\"x\":1}".to_string()
                },
                SseEvent {
                    event: None,
                    data: "[DONE]".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_sse_decoder_flushes_on_finish() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        let events = decoder.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[tokio::test]
    async fn test_sse_fragment_stream_stops_at_done() {
        let stream = sse_fragment_stream(
            chunks(&[b"data: Hola\n\ndata: , mun", b"do\n\ndata: [DONE]\n\ndata: ignored\n\n"]),
            "test",
            |event| {
                if event.data == "[DONE]" {
                    Ok(Frame::Done)
                } else {
                    Ok(Frame::Text(event.data))
                }
            },
        );
        let fragments: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(fragments, vec!["Hola", ", mundo"]);
    }

    #[tokio::test]
    async fn test_parse_error_terminates_stream() {
        let stream = line_fragment_stream(chunks(&[b"ok\nbad\nlater\n"]), "test", |line| {
            if line == "bad" {
                Err(RouterError::unavailable("test", "malformed frame"))
            } else {
                Ok(Frame::Text(line))
            }
        });
        let items: Vec<Result<String>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "ok");
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_line_stream_flushes_unterminated_tail() {
        let stream = line_fragment_stream(chunks(&[b"a\nb"]), "test", |line| Ok(Frame::Text(line)));
        let fragments: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(fragments, vec!["a", "b"]);
    }
}

//! Streaming chat: provider iteration wrapped in a [`StreamBuffer`].
//!
//! The producer runs on its own task and talks to the caller through a
//! bounded channel. A failed send means the caller dropped the stream; the
//! task then stops reading the backend and commits nothing.

use std::time::Instant;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::Orchestrator;
use crate::ai::prompt::{apply_disclaimer, fallback_response, format_response, system_prompt};
use crate::ai::provider::{SharedBackend, TokenUsage};
use crate::ai::stream::{ChatStream, StreamBuffer, StreamEvent, StreamingMode, split_paragraphs};
use crate::ai::timeout::with_timeout;
use crate::types::{ChatRequest, ChatResponse, Mode, RouterError};

type EventSender = mpsc::Sender<StreamEvent>;

/// The receiving side went away
#[derive(Debug)]
struct Cancelled;

async fn send(tx: &EventSender, event: StreamEvent) -> Result<(), Cancelled> {
    tx.send(event).await.map_err(|_| Cancelled)
}

/// Outcome of one provider attempt
enum Attempt {
    Completed {
        response: ChatResponse,
        usage: Option<TokenUsage>,
        streaming_mode: StreamingMode,
    },
    /// Nothing reached the caller; try the next candidate
    Failed(RouterError),
    /// Chunks were already emitted; the stream must end with `error`
    Interrupted(RouterError),
}

/// Per-request inputs shared by every attempt
struct StreamTurn<'a> {
    request: &'a ChatRequest,
    mode: Mode,
    system: String,
}

impl Orchestrator {
    /// Streaming chat. The returned stream always ends with exactly one
    /// `done` or `error` event.
    pub fn stream_chat(&self, request: ChatRequest) -> ChatStream {
        let (tx, rx) = mpsc::channel(self.stream.channel_capacity.max(1));
        let orchestrator = self.clone();
        let span = info_span!(
            "stream_chat",
            request_id = %Uuid::new_v4(),
            requested_mode = ?request.mode
        );

        tokio::spawn(
            async move {
                if orchestrator.run_stream(&request, &tx).await.is_err() {
                    debug!("Stream receiver dropped, stopping");
                }
            }
            .instrument(span),
        );

        ChatStream::new(rx)
    }

    async fn run_stream(&self, request: &ChatRequest, tx: &EventSender) -> Result<(), Cancelled> {
        let (mode, decision) = self.resolve_mode(request).await;
        send(tx, StreamEvent::Mode { mode, decision }).await?;

        if let Some(hit) = self.cache.get(&request.message, mode, &request.context).await {
            debug!(mode = %mode, layer = %hit.cache_layer, "Replaying cached response");
            return self.replay(tx, &hit, StreamingMode::Cached).await;
        }

        let candidates = match self.router.select_next(mode) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(mode = %mode, error = %e, "No provider available");
                return self
                    .replay(tx, &fallback_response(mode), StreamingMode::BufferedFallback)
                    .await;
            }
        };

        let turn = StreamTurn {
            request,
            mode,
            system: system_prompt(mode, &request.context, self.prompt.max_context_chars),
        };

        for provider in candidates {
            let Some(backend) = self.attemptable(&provider) else {
                continue;
            };
            let model = self.router.resolve_model(&provider, mode);
            debug!(
                provider = %provider,
                model = %model,
                streaming = backend.supports_streaming(),
                "Attempting provider"
            );

            let started = Instant::now();
            let attempt = if backend.supports_streaming() {
                self.attempt_streaming(tx, &turn, &backend, &provider, &model).await?
            } else {
                self.attempt_buffered(tx, &turn, &backend, &provider, &model).await?
            };

            match attempt {
                Attempt::Completed {
                    response,
                    usage,
                    streaming_mode,
                } => {
                    // Provider health counts even if the caller is gone
                    self.router.breakers().record_success(&provider);
                    send(tx, done_event(&response, streaming_mode)).await?;

                    // Latency, cache and usage are committed only once `done` is delivered
                    self.usage
                        .record_latency_sample(started.elapsed().as_secs_f64());
                    self.cache
                        .set(&request.message, mode, &request.context, &response)
                        .await;
                    self.usage
                        .record(&provider, &model, &request.message, &response.text, usage);
                    info!(provider = %provider, mode = %mode, streaming_mode = %streaming_mode, "Stream completed");
                    return Ok(());
                }
                Attempt::Failed(e) => self.record_attempt_failure(&provider, &e),
                Attempt::Interrupted(e) => {
                    self.record_attempt_failure(&provider, &e);
                    let message = RouterError::StreamInterrupted {
                        provider: provider.clone(),
                        reason: e.to_string(),
                    }
                    .to_string();
                    return send(tx, StreamEvent::Error { message }).await;
                }
            }
        }

        warn!(mode = %mode, "All providers exhausted, streaming fallback");
        self.replay(tx, &fallback_response(mode), StreamingMode::BufferedFallback)
            .await
    }

    async fn attempt_streaming(
        &self,
        tx: &EventSender,
        turn: &StreamTurn<'_>,
        backend: &SharedBackend,
        provider: &str,
        model: &str,
    ) -> Result<Attempt, Cancelled> {
        let options = self.generation_options();
        let opened = with_timeout(
            self.timeouts.request,
            backend.stream(&turn.system, &turn.request.message, model, &options),
            "stream open",
        )
        .await;
        let mut fragments = match opened {
            Ok(fragments) => fragments,
            Err(e) => return Ok(Attempt::Failed(e)),
        };

        let mut buffer = StreamBuffer::new(&self.stream, self.masker.clone());
        loop {
            let failure = match tokio::time::timeout(self.timeouts.request, fragments.next()).await {
                Ok(Some(Ok(fragment))) => {
                    if let Some(chunk) = buffer.push(&fragment) {
                        send(tx, chunk).await?;
                    }
                    continue;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => e,
                Err(_) => RouterError::timeout("stream fragment", self.timeouts.request),
            };

            return Ok(if buffer.chunks_emitted() == 0 {
                debug!(provider = %provider, "Stream failed before first chunk");
                Attempt::Failed(failure)
            } else {
                Attempt::Interrupted(failure)
            });
        }

        if let Some(chunk) = buffer.flush() {
            send(tx, chunk).await?;
        }

        // The disclaimer goes out as a trailing chunk so the chunks still
        // concatenate to the final text
        let raw = buffer.full_text().to_string();
        let finished = apply_disclaimer(&raw, turn.mode);
        if let Some(suffix) = finished.strip_prefix(raw.as_str())
            && !suffix.is_empty()
            && let Some(chunk) = buffer.emit_segment(suffix)
        {
            send(tx, chunk).await?;
        }

        let response = format_response(
            buffer.full_text(),
            turn.mode,
            provider,
            model,
            self.prompt.max_suggestions,
        );
        Ok(Attempt::Completed {
            response,
            usage: None,
            streaming_mode: StreamingMode::Real,
        })
    }

    async fn attempt_buffered(
        &self,
        tx: &EventSender,
        turn: &StreamTurn<'_>,
        backend: &SharedBackend,
        provider: &str,
        model: &str,
    ) -> Result<Attempt, Cancelled> {
        let options = self.generation_options();
        let result = with_timeout(
            self.timeouts.request,
            backend.chat(&turn.system, &turn.request.message, model, &options),
            "generation request",
        )
        .await;
        let generation = match result {
            Ok(generation) => generation,
            Err(e) => return Ok(Attempt::Failed(e)),
        };

        let response = format_response(
            &generation.text,
            turn.mode,
            provider,
            model,
            self.prompt.max_suggestions,
        );
        self.emit_paragraphs(tx, &response.text).await?;

        Ok(Attempt::Completed {
            response,
            usage: generation.usage,
            streaming_mode: StreamingMode::BufferedFallback,
        })
    }

    /// Stream an already complete response, then `done`
    async fn replay(
        &self,
        tx: &EventSender,
        response: &ChatResponse,
        streaming_mode: StreamingMode,
    ) -> Result<(), Cancelled> {
        self.emit_paragraphs(tx, &response.text).await?;
        send(tx, done_event(response, streaming_mode)).await
    }

    async fn emit_paragraphs(&self, tx: &EventSender, text: &str) -> Result<(), Cancelled> {
        let mut buffer = StreamBuffer::new(&self.stream, self.masker.clone());
        for segment in split_paragraphs(text) {
            if let Some(chunk) = buffer.emit_segment(&segment) {
                send(tx, chunk).await?;
            }
        }
        Ok(())
    }
}

fn done_event(response: &ChatResponse, streaming_mode: StreamingMode) -> StreamEvent {
    StreamEvent::Done {
        text: response.text.clone(),
        provider: response.provider.clone(),
        model: response.model.clone(),
        suggestions: response.suggestions.clone(),
        streaming_mode,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::storage::StateStore;
    use crate::types::ChatContext;

    fn chunks(events: &[StreamEvent]) -> Vec<(usize, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk { text, index } => Some((*index, text.clone())),
                _ => None,
            })
            .collect()
    }

    fn chunk_text(events: &[StreamEvent]) -> String {
        chunks(events).into_iter().map(|(_, text)| text).collect()
    }

    fn terminal(events: &[StreamEvent]) -> &StreamEvent {
        let last = events.last().unwrap();
        assert!(last.is_terminal());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        last
    }

    #[tokio::test]
    async fn test_stream_emits_mode_chunks_done_in_order() {
        let backend = MockBackend::new("anthropic").fragments(&[
            "Primero, define tu cliente ideal. ",
            "Después, ",
            "habla con diez de ellos esta semana.",
        ]);
        let fx = Fixture::new(vec![backend]);

        let events = fx
            .orchestrator
            .stream_chat(ChatRequest::new("¿cómo valido?").with_mode(Mode::Consultor))
            .collect_events()
            .await;

        assert!(matches!(events[0], StreamEvent::Mode { mode: Mode::Consultor, decision: None }));
        let indices: Vec<usize> = chunks(&events).iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, (0..indices.len()).collect::<Vec<_>>());

        match terminal(&events) {
            StreamEvent::Done {
                text,
                provider,
                streaming_mode,
                ..
            } => {
                assert_eq!(provider, "anthropic");
                assert_eq!(*streaming_mode, StreamingMode::Real);
                assert_eq!(&chunk_text(&events), text);
            }
            other => panic!("unexpected terminal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_text_matches_buffered_chat() {
        let fragments = ["El IVA se declara ", "con el modelo 303.\n\n", "1. Revisa los plazos"];
        let streamed = Fixture::new(vec![MockBackend::new("anthropic").fragments(&fragments)]);
        let buffered = Fixture::new(vec![MockBackend::new("anthropic").fragments(&fragments)]);
        let request = ChatRequest::new("¿cuándo presento el IVA?").with_mode(Mode::Fiscal);

        let events = streamed.orchestrator.stream_chat(request.clone()).collect_events().await;
        let response = buffered.orchestrator.chat(&request).await;

        assert_eq!(chunk_text(&events), response.text);
        match terminal(&events) {
            StreamEvent::Done { text, suggestions, .. } => {
                assert_eq!(text, &response.text);
                assert!(text.contains("asesor fiscal colegiado"));
                assert_eq!(suggestions, &vec!["Revisa los plazos".to_string()]);
            }
            other => panic!("unexpected terminal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_before_first_chunk_advances() {
        let broken = MockBackend::new("anthropic").fragments(&["Hola"]).fail_after(0);
        let healthy = MockBackend::new("openai").fragments(&["Respuesta completa."]);
        let fx = Fixture::new(vec![broken, healthy]);

        let events = fx
            .orchestrator
            .stream_chat(ChatRequest::new("hola").with_mode(Mode::Coach))
            .collect_events()
            .await;

        match terminal(&events) {
            StreamEvent::Done { provider, .. } => assert_eq!(provider, "openai"),
            other => panic!("unexpected terminal {:?}", other),
        }
        assert_eq!(fx.orchestrator.breakers().snapshot("anthropic").failures, 1);
    }

    #[tokio::test]
    async fn test_failure_after_chunks_ends_with_error() {
        let broken = MockBackend::new("anthropic")
            .fragments(&["Primera frase completa aquí.", " Segunda frase."])
            .fail_after(1);
        let healthy = MockBackend::new("openai").fragments(&["No debería usarse."]);
        let fx = Fixture::new(vec![broken, healthy.clone()]);
        let request = ChatRequest::new("hola").with_mode(Mode::Coach);

        let events = fx.orchestrator.stream_chat(request.clone()).collect_events().await;

        assert_eq!(chunks(&events).len(), 1);
        match terminal(&events) {
            StreamEvent::Error { message } => assert!(message.contains("anthropic")),
            other => panic!("unexpected terminal {:?}", other),
        }
        assert_eq!(healthy.calls(), 0);
        assert_eq!(fx.orchestrator.breakers().snapshot("anthropic").failures, 1);
        assert_eq!(fx.store.get_i64("ai_cost_total_calls").unwrap(), 0);
        assert!(fx.orchestrator.cache().get("hola", Mode::Coach, &ChatContext::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_non_streaming_backend_uses_buffered_fallback() {
        let backend = MockBackend::new("openai").reply("Uno.\n\nDos.\n\nTres.");
        let fx = Fixture::new(vec![backend]);

        let events = fx
            .orchestrator
            .stream_chat(ChatRequest::new("hola").with_mode(Mode::Cfo))
            .collect_events()
            .await;

        assert_eq!(
            chunks(&events),
            vec![
                (0, "Uno.\n\n".to_string()),
                (1, "Dos.\n\n".to_string()),
                (2, "Tres.".to_string())
            ]
        );
        match terminal(&events) {
            StreamEvent::Done { streaming_mode, .. } => {
                assert_eq!(*streaming_mode, StreamingMode::BufferedFallback)
            }
            other => panic!("unexpected terminal {:?}", other),
        }
        assert_eq!(fx.store.get_i64("ai_cost_total_calls").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_repeat_stream_replays_cache() {
        let backend = MockBackend::new("anthropic").fragments(&["Valida primero.\n\n", "Luego escala."]);
        let fx = Fixture::new(vec![backend.clone()]);
        let request = ChatRequest::new("¿escalo ya?").with_mode(Mode::Devil);

        let first = fx.orchestrator.stream_chat(request.clone()).collect_events().await;
        let second = fx.orchestrator.stream_chat(request).collect_events().await;

        assert_eq!(backend.calls(), 1);
        assert_eq!(chunk_text(&first), chunk_text(&second));
        match terminal(&second) {
            StreamEvent::Done { streaming_mode, provider, .. } => {
                assert_eq!(*streaming_mode, StreamingMode::Cached);
                assert_eq!(provider, "anthropic");
            }
            other => panic!("unexpected terminal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exhaustion_streams_fallback() {
        let fx = Fixture::new(vec![MockBackend::new("anthropic").fragments(&["x"]).failing()]);

        let events = fx
            .orchestrator
            .stream_chat(ChatRequest::new("hola").with_mode(Mode::LandingCopilot))
            .collect_events()
            .await;

        assert!(!chunks(&events).is_empty());
        match terminal(&events) {
            StreamEvent::Done {
                provider,
                text,
                streaming_mode,
                ..
            } => {
                assert_eq!(provider, "fallback");
                assert_eq!(*streaming_mode, StreamingMode::BufferedFallback);
                assert_eq!(&chunk_text(&events), text);
            }
            other => panic!("unexpected terminal {:?}", other),
        }
        assert_eq!(fx.orchestrator.cache().stats().entries, 0);
    }

    #[tokio::test]
    async fn test_chunks_are_masked_but_done_is_not() {
        let backend = MockBackend::new("anthropic").fragments(&["Escríbeme a ana@example.com cuando puedas."]);
        let fx = Fixture::new(vec![backend]);

        let events = fx
            .orchestrator
            .stream_chat(ChatRequest::new("contacto").with_mode(Mode::Coach))
            .collect_events()
            .await;

        assert!(chunk_text(&events).contains("[REDACTED_EMAIL]"));
        match terminal(&events) {
            StreamEvent::Done { text, .. } => assert!(text.contains("ana@example.com")),
            other => panic!("unexpected terminal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_stream_commits_nothing() {
        let backend = MockBackend::new("anthropic")
            .fragments(&["Uno.", " Dos.", " Tres.", " Cuatro.", " Cinco."])
            .delay_ms(20);
        let fx = Fixture::new(vec![backend.clone()]);
        let request = ChatRequest::new("hola").with_mode(Mode::Sparring);

        let mut stream = fx.orchestrator.stream_chat(request.clone());
        assert!(matches!(stream.next_event().await, Some(StreamEvent::Mode { .. })));
        drop(stream);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(backend.fragments_yielded() < 5);
        assert_eq!(fx.store.get_i64("ai_cost_total_calls").unwrap(), 0);
        assert!(fx.orchestrator.cache().get("hola", Mode::Sparring, &ChatContext::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_drop_before_done_records_no_latency() {
        // The trailing empty fragment holds the stream open after the last chunk
        let backend = MockBackend::new("anthropic")
            .fragments(&["Primera frase completa aquí.", ""])
            .delay_ms(50);
        let fx = Fixture::new(vec![backend.clone()]);
        let request = ChatRequest::new("hola").with_mode(Mode::Sparring);

        let mut stream = fx.orchestrator.stream_chat(request);
        assert!(matches!(stream.next_event().await, Some(StreamEvent::Mode { .. })));
        assert!(matches!(stream.next_event().await, Some(StreamEvent::Chunk { .. })));
        drop(stream);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(backend.fragments_yielded(), 2);
        assert_eq!(fx.orchestrator.usage().metrics_summary().latency.samples, 0);
        assert_eq!(fx.store.get_i64("ai_cost_total_calls").unwrap(), 0);
        assert_eq!(fx.orchestrator.breakers().snapshot("anthropic").failures, 0);
    }

    #[tokio::test]
    async fn test_completed_stream_records_latency() {
        let fx = Fixture::new(vec![MockBackend::new("anthropic").fragments(&["Hola."])]);
        fx.orchestrator
            .stream_chat(ChatRequest::new("hola").with_mode(Mode::Sparring))
            .collect_events()
            .await;
        assert_eq!(fx.orchestrator.usage().metrics_summary().latency.samples, 1);
    }

    #[tokio::test]
    async fn test_unset_mode_is_announced_with_decision() {
        let fx = Fixture::new(vec![MockBackend::new("anthropic").fragments(&["Te escucho."])]);

        let events = fx
            .orchestrator
            .stream_chat(ChatRequest::new("tengo miedo de fracasar"))
            .collect_events()
            .await;

        match &events[0] {
            StreamEvent::Mode { mode, decision } => {
                assert_eq!(*mode, Mode::Coach);
                assert_eq!(decision.as_ref().unwrap().mode, Mode::Coach);
            }
            other => panic!("unexpected first event {:?}", other),
        }
    }
}

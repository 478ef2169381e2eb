//! Re-framing the backend's streamed chat into the gateway's NDJSON chunks.
//!
//! Each backend line becomes `{"delta": "...", "done": false}`. The backend's
//! final line becomes `{"delta": "...", "done": true, "model": ..., "usage": {...}}`.
//! Usage is recorded once per stream, as an error if it ended early or the
//! client went away.

use std::time::Instant;

use async_stream::stream;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::json;

use super::{Usage, elapsed_ms, record_usage};
use crate::ollama::ChatResponse;
use crate::registry::{NewUsage, RequestType, UsageOutcome, UsageStore};

pub(super) struct StreamContext {
    /// Backend identifier echoed to the client
    pub model_name: String,
    /// Registry id the usage record points at
    pub model_id: String,
    pub user_id: String,
    pub usage: UsageStore,
    pub started: Instant,
}

/// Owns the usage bookkeeping for one stream.
///
/// Records inline when the stream runs to its end. If the stream is dropped
/// first, `Drop` records on a spawned task instead.
struct UsageGuard {
    ctx: StreamContext,
    usage: Usage,
    outcome: UsageOutcome,
    recorded: bool,
}

impl UsageGuard {
    fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            usage: Usage::default(),
            outcome: UsageOutcome::Error,
            recorded: false,
        }
    }

    fn complete(&mut self, usage: Usage) {
        self.usage = usage;
        self.outcome = UsageOutcome::Success;
    }

    fn new_usage(&self) -> NewUsage {
        NewUsage {
            model_id: self.ctx.model_id.clone(),
            user_id: self.ctx.user_id.clone(),
            request_type: RequestType::Chat,
            prompt_tokens: self.usage.prompt_tokens,
            completion_tokens: self.usage.completion_tokens,
            latency_ms: elapsed_ms(self.ctx.started),
            outcome: self.outcome,
        }
    }

    async fn finish(&mut self) {
        if self.outcome == UsageOutcome::Error {
            tracing::warn!(
                "Chat stream for {} ended before completion",
                self.ctx.model_name
            );
        }
        self.recorded = true;
        record_usage(&self.ctx.usage, self.new_usage()).await;
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        if self.recorded {
            return;
        }
        if self.outcome == UsageOutcome::Error {
            tracing::warn!(
                "Chat stream for {} dropped before completion",
                self.ctx.model_name
            );
        }
        let store = self.ctx.usage.clone();
        let usage = self.new_usage();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { record_usage(&store, usage).await });
            }
            Err(_) => tracing::warn!("No runtime to record usage for a dropped stream"),
        }
    }
}

fn ndjson_line(value: serde_json::Value) -> Bytes {
    let mut line = value.to_string();
    line.push('\n');
    Bytes::from(line)
}

/// One backend line, without its newline
fn parse_event(line: &[u8]) -> Option<ChatResponse> {
    let Ok(text) = std::str::from_utf8(line) else {
        tracing::debug!("Skipping non-UTF-8 stream line");
        return None;
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(event) => Some(event),
        Err(_) => {
            tracing::debug!("Skipping unparseable stream line: {text}");
            None
        }
    }
}

pub(super) fn ndjson_chat_stream(
    body: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    ctx: StreamContext,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    // Built outside the generator so an unpolled stream still records on drop
    let mut guard = UsageGuard::new(ctx);

    stream! {
        use futures_util::StreamExt;

        // Raw bytes: a multibyte character may straddle two chunks
        let mut buffer: Vec<u8> = Vec::new();
        let mut body = std::pin::pin!(body);
        let mut eof = false;

        'read: while !eof {
            match body.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    yield Err(std::io::Error::other(e));
                    break;
                }
                None => {
                    eof = true;
                    if buffer.is_empty() {
                        break;
                    }
                    buffer.push(b'\n');
                }
            }

            while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
                let Some(event) = parse_event(&line[..newline_pos]) else {
                    continue;
                };
                let delta = event.message.map(|m| m.content).unwrap_or_default();

                if event.done {
                    let usage = Usage::new(
                        event.prompt_eval_count.unwrap_or(0),
                        event.eval_count.unwrap_or(0),
                    );
                    guard.complete(usage);
                    yield Ok(ndjson_line(json!({
                        "delta": delta,
                        "done": true,
                        "model": &guard.ctx.model_name,
                        "usage": usage,
                    })));
                    break 'read;
                }
                yield Ok(ndjson_line(json!({ "delta": delta, "done": false })));
            }
        }

        guard.finish().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::UsageFilter;
    use crate::test_utils::test_db;
    use futures_util::StreamExt;
    use serde_json::Value;
    use std::time::Duration;

    fn context(usage: UsageStore) -> StreamContext {
        StreamContext {
            model_name: "mistral:7b".into(),
            model_id: "reg-1".into(),
            user_id: "u1".into(),
            usage,
            started: Instant::now(),
        }
    }

    fn chunks(parts: Vec<Vec<u8>>) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Send {
        futures_util::stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<_, reqwest::Error>(Bytes::from(p))),
        )
    }

    async fn records(usage: &UsageStore) -> Vec<crate::registry::UsageRecord> {
        usage
            .list(UsageFilter {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_multibyte_split_across_chunks() {
        let (_dir, db) = test_db().await;
        let usage = UsageStore::new(db);

        let first = "{\"message\":{\"role\":\"assistant\",\"content\":\"café\"},\"done\":false}\n\
                     {\"done\":true,\"prompt_eval_count\":1,\"eval_count\":1}";
        let bytes = first.as_bytes();
        // Split inside the two-byte 'é'
        let split = first.find('é').unwrap() + 1;
        let body = chunks(vec![bytes[..split].to_vec(), bytes[split..].to_vec()]);

        let out: Vec<Bytes> = ndjson_chat_stream(body, context(usage.clone()))
            .map(|c| c.unwrap())
            .collect()
            .await;
        let lines: Vec<Value> = out
            .iter()
            .map(|c| serde_json::from_slice(c).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["delta"], "café");
        assert_eq!(lines[1]["done"], true);

        let recs = records(&usage).await;
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].outcome, UsageOutcome::Success);
        assert_eq!(recs[0].total_tokens, 2);
    }

    #[tokio::test]
    async fn test_dropped_stream_records_error() {
        let (_dir, db) = test_db().await;
        let usage = UsageStore::new(db);

        let line = "{\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n";
        let body = chunks(vec![line.as_bytes().to_vec(), line.as_bytes().to_vec()]);
        let mut stream = Box::pin(ndjson_chat_stream(body, context(usage.clone())));
        assert!(stream.next().await.is_some());
        drop(stream);

        let mut recs = Vec::new();
        for _ in 0..50 {
            recs = records(&usage).await;
            if !recs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].outcome, UsageOutcome::Error);
        assert_eq!(recs[0].model_id, "reg-1");
    }

    #[tokio::test]
    async fn test_unpolled_stream_still_records() {
        let (_dir, db) = test_db().await;
        let usage = UsageStore::new(db);

        let stream = ndjson_chat_stream(chunks(vec![]), context(usage.clone()));
        drop(stream);

        let mut recs = Vec::new();
        for _ in 0..50 {
            recs = records(&usage).await;
            if !recs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].outcome, UsageOutcome::Error);
    }
}

//! Streaming HTTP client for the filtered status feed.
//!
//! A connection is a long-lived POST whose response body is newline-delimited JSON, one status
//! per line, with blank lines as keep-alives. Each connection owns a reader task; disconnecting
//! cancels it and waits for it to finish so no signal escapes after teardown.

use std::{collections::BTreeSet, fmt, pin::pin, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use track_mux::{
    EventSink, IncomingEvent, Upstream, UpstreamConnection, UpstreamError, UpstreamSignal,
};

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub endpoint: String,
    pub bearer_token: Option<String>,
    pub language: Option<String>,
    pub connect_timeout: Duration,
    /// Longest the feed may stay silent, keep-alives included, before it counts as stalled.
    pub idle_timeout: Duration,
    pub max_line_bytes: usize,
}

/// Upper bound on one status line; real statuses are a few kilobytes.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Copy)]
struct ReadLimits {
    idle_timeout: Duration,
    max_line_bytes: usize,
}

pub struct HttpStreamUpstream {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpStreamUpstream {
    pub fn new(config: UpstreamConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Upstream for HttpStreamUpstream {
    async fn connect(
        &self,
        filters: BTreeSet<String>,
        sink: EventSink,
    ) -> Result<Box<dyn UpstreamConnection>, UpstreamError> {
        let track = filters.into_iter().collect::<Vec<_>>().join(",");
        let mut form = vec![("track", track)];
        if let Some(language) = &self.config.language {
            form.push(("language", language.clone()));
        }

        let mut request = self.client.post(&self.config.endpoint).form(&form);
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = timeout(self.config.idle_timeout, request.send())
            .await
            .map_err(|_| UpstreamError::Transient("no response from upstream".into()))?
            .map_err(|err| UpstreamError::Transient(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        info!(
            target = "stream.upstream",
            generation = sink.generation(),
            "upstream stream opened"
        );
        let cancel = CancellationToken::new();
        let limits = ReadLimits {
            idle_timeout: self.config.idle_timeout,
            max_line_bytes: self.config.max_line_bytes,
        };
        let reader = tokio::spawn(read_stream(
            response.bytes_stream(),
            sink,
            cancel.clone(),
            limits,
        ));
        Ok(Box::new(HttpStreamConnection {
            cancel,
            reader: Some(reader),
        }))
    }
}

struct HttpStreamConnection {
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

#[async_trait]
impl UpstreamConnection for HttpStreamConnection {
    async fn disconnect(&mut self) {
        self.cancel.cancel();
        if let Some(reader) = self.reader.take() {
            if let Err(err) = reader.await {
                warn!(target = "stream.upstream", error = %err, "stream reader ended abnormally");
            }
        }
    }
}

impl Drop for HttpStreamConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn classify_status(status: StatusCode) -> UpstreamError {
    match status.as_u16() {
        420 | 429 => UpstreamError::RateLimited,
        401 | 403 => UpstreamError::Unauthorized(format!("upstream answered {status}")),
        _ => UpstreamError::Transient(format!("upstream answered {status}")),
    }
}

/// Reads newline-delimited statuses until the body ends, fails, stalls for longer than
/// `limits.idle_timeout`, or grows a line past `limits.max_line_bytes`. Keep-alive newlines
/// count as activity.
async fn read_stream<S, E>(
    body: S,
    sink: EventSink,
    cancel: CancellationToken,
    limits: ReadLimits,
) where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    let mut body = pin!(body);
    let mut buffer: Vec<u8> = Vec::new();
    let failure = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = timeout(limits.idle_timeout, body.next()) => next,
        };
        let chunk = match next {
            Err(_) => {
                break UpstreamSignal::Error(UpstreamError::Transient(format!(
                    "stream stalled for {}s",
                    limits.idle_timeout.as_secs_f64()
                )))
            }
            Ok(None) => break UpstreamSignal::Closed,
            Ok(Some(Err(err))) => {
                break UpstreamSignal::Error(UpstreamError::Transient(err.to_string()))
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        buffer.extend_from_slice(&chunk);
        while let Some(end) = buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = buffer.drain(..=end).collect();
            let Some(event) = parse_status_line(&line) else {
                continue;
            };
            let delivered = tokio::select! {
                _ = cancel.cancelled() => return,
                delivered = sink.send(UpstreamSignal::Event(event)) => delivered,
            };
            if !delivered {
                return;
            }
        }
        if buffer.len() > limits.max_line_bytes {
            break UpstreamSignal::Error(UpstreamError::Transient(format!(
                "status line exceeded {} bytes",
                limits.max_line_bytes
            )));
        }
    };

    warn!(
        target = "stream.upstream",
        generation = sink.generation(),
        signal = ?failure,
        "stream reader stopping"
    );
    if !cancel.is_cancelled() {
        sink.send(failure).await;
    }
}

#[derive(Deserialize)]
struct WireStatus {
    text: Option<String>,
    full_text: Option<String>,
    extended_tweet: Option<ExtendedTweet>,
    retweeted_status: Option<serde::de::IgnoredAny>,
    limit: Option<serde::de::IgnoredAny>,
}

#[derive(Deserialize)]
struct ExtendedTweet {
    full_text: Option<String>,
}

/// Parses one line of the feed. Keep-alives, notices and lines that are not statuses yield
/// `None`.
pub fn parse_status_line(line: &[u8]) -> Option<IncomingEvent> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    let status: WireStatus = match serde_json::from_slice(trimmed) {
        Ok(status) => status,
        Err(err) => {
            debug!(target = "stream.upstream", error = %err, "skipping unparsable line");
            return None;
        }
    };
    if status.limit.is_some() {
        debug!(target = "stream.upstream", "upstream delivery limit notice");
        return None;
    }
    let text = status.text.or(status.full_text)?;
    Some(IncomingEvent {
        text,
        extended_text: status.extended_tweet.and_then(|extended| extended.full_text),
        is_retweet: status.retweeted_status.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio::sync::mpsc;

    fn limits(idle_ms: u64, max_line_bytes: usize) -> ReadLimits {
        ReadLimits {
            idle_timeout: Duration::from_millis(idle_ms),
            max_line_bytes,
        }
    }

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        stream::iter(
            parts
                .iter()
                .map(|part| Ok(Bytes::from_static(part.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn drain(
        body: impl Stream<Item = Result<Bytes, std::io::Error>>,
        limits: ReadLimits,
    ) -> Vec<UpstreamSignal> {
        let (tx, mut rx) = mpsc::channel(16);
        read_stream(body, EventSink::new(7, tx), CancellationToken::new(), limits).await;
        let mut signals = Vec::new();
        while let Ok((generation, signal)) = rx.try_recv() {
            assert_eq!(generation, 7);
            signals.push(signal);
        }
        signals
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn reader_reassembles_lines_split_across_chunks() {
        let signals = drain(
            chunks(&["{\"text\":\"hello ", "cat\"}\r\n\r\n{\"text\":", "\"dog\"}\n"]),
            limits(1_000, 1024),
        )
        .await;
        assert_eq!(
            signals,
            vec![
                UpstreamSignal::Event(IncomingEvent::new("hello cat")),
                UpstreamSignal::Event(IncomingEvent::new("dog")),
                UpstreamSignal::Closed,
            ]
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn silent_stream_is_reported_as_stalled() {
        let signals = drain(stream::pending(), limits(50, 1024)).await;
        assert!(matches!(
            signals.as_slice(),
            [UpstreamSignal::Error(UpstreamError::Transient(reason))] if reason.contains("stalled")
        ));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn keepalives_reset_the_stall_timer() {
        let beats = stream::iter(0..5).then(|_| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, std::io::Error>(Bytes::from_static(b"\r\n"))
        });
        let signals = drain(beats, limits(80, 1024)).await;
        assert_eq!(signals, vec![UpstreamSignal::Closed]);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn overlong_line_is_rejected() {
        let body = chunks(&["{\"text\":\"", "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"]);
        let signals = drain(body, limits(1_000, 16)).await;
        assert!(matches!(
            signals.as_slice(),
            [UpstreamSignal::Error(UpstreamError::Transient(reason))] if reason.contains("exceeded")
        ));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn cancelled_reader_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        read_stream(
            stream::pending::<Result<Bytes, std::io::Error>>(),
            EventSink::new(1, tx),
            cancel,
            limits(1_000, 1024),
        )
        .await;
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn status_codes_map_to_upstream_errors() {
        assert_eq!(
            classify_status(StatusCode::from_u16(420).unwrap()),
            UpstreamError::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            UpstreamError::RateLimited
        );
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED),
            UpstreamError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            UpstreamError::Transient(_)
        ));
    }

    #[test_timeout::timeout]
    fn parses_plain_and_extended_statuses() {
        let plain = parse_status_line(br#"{"text":"hello cat"}"#).expect("status");
        assert_eq!(plain.text, "hello cat");
        assert_eq!(plain.extended_text, None);
        assert!(!plain.is_retweet);

        let extended = parse_status_line(
            br#"{"text":"short...","extended_tweet":{"full_text":"the whole cat story"}}"#,
        )
        .expect("status");
        assert_eq!(extended.extended_text.as_deref(), Some("the whole cat story"));
    }

    #[test_timeout::timeout]
    fn flags_retweets() {
        let retweet =
            parse_status_line(br#"{"text":"RT cat","retweeted_status":{"text":"cat"}}"#)
                .expect("status");
        assert!(retweet.is_retweet);
    }

    #[test_timeout::timeout]
    fn skips_keepalives_notices_and_garbage() {
        assert!(parse_status_line(b"\r\n").is_none());
        assert!(parse_status_line(br#"{"limit":{"track":12}}"#).is_none());
        assert!(parse_status_line(br#"{"delete":{"status":{"id":1}}}"#).is_none());
        assert!(parse_status_line(b"not json").is_none());
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-request records.
//!
//! Request and response bodies are duplicated while they stream: the
//! forwarder (or the client connection) stays the authoritative consumer and
//! every chunk is also pushed into an unbounded channel.  A detached task
//! drains both channels, waits for the response to finish streaming, and
//! emits exactly one record.  Nothing here can delay or fail a response.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use reqwest::header::{HOST, HeaderMap, USER_AGENT};
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::ProxyRequest;
use crate::logging::config::LoggingConfig;
use crate::logging::structured::{create_logger, discard_logger};

/// One completed request/response exchange.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub request_id: String,
    pub received_at: DateTime<Utc>,
    pub duration: Duration,
    pub status: u16,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub host: String,
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    pub request_headers: HeaderMap,
    pub response_headers: HeaderMap,
    /// Best-effort copy, truncated to `max_body_size`
    pub request_body: Bytes,
    /// The body as sent to the client, truncated to `max_body_size`
    pub response_body: Bytes,
    pub request_body_size: usize,
    pub response_body_size: usize,
}

/// Request metadata captured before the request is handed to the pipeline.
#[derive(Debug)]
pub struct PendingRecord {
    request_id: String,
    received_at: DateTime<Utc>,
    started: Instant,
    method: String,
    path: String,
    query: Option<String>,
    host: String,
    remote_addr: Option<String>,
    user_agent: Option<String>,
    request_headers: HeaderMap,
}

impl PendingRecord {
    pub fn from_request(request: &ProxyRequest) -> Self {
        let host = if request.host.is_empty() {
            header_str(&request.headers, HOST).unwrap_or_default()
        } else {
            request.host.clone()
        };
        Self {
            request_id: request.context.request_id.clone(),
            received_at: Utc::now(),
            started: request.context.received_at,
            method: request.method.to_string(),
            path: request.path.clone(),
            query: request.query.clone(),
            host,
            remote_addr: request.context.client_addr.map(|a| a.to_string()),
            user_agent: header_str(&request.headers, USER_AGENT),
            request_headers: request.headers.clone(),
        }
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Receiving side of a duplicated body.
#[derive(Debug)]
pub struct BodyCopy {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl BodyCopy {
    /// Drain until the original body is dropped.  Returns the first `limit`
    /// bytes and the total size seen.
    async fn collect(mut self, limit: usize) -> (Bytes, usize) {
        let mut captured = BytesMut::new();
        let mut total = 0;
        while let Some(chunk) = self.rx.recv().await {
            total += chunk.len();
            if captured.len() < limit {
                let take = (limit - captured.len()).min(chunk.len());
                captured.extend_from_slice(&chunk[..take]);
            }
        }
        (captured.freeze(), total)
    }
}

/// Duplicate `body` while it streams.
///
/// The copy channel closes when the returned body is fully read or dropped.
pub fn tee_body(body: reqwest::Body) -> (reqwest::Body, BodyCopy) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = body.into_data_stream().inspect_ok(move |chunk: &Bytes| {
        // The collector may already be gone; the client never notices
        let _ = tx.send(chunk.clone());
    });
    (reqwest::Body::wrap_stream(stream), BodyCopy { rx })
}

/// Emits one record per request through an asynchronous slog drain.
#[derive(Debug, Clone)]
pub struct RequestLogger {
    logger: Logger,
    config: Arc<LoggingConfig>,
}

impl RequestLogger {
    pub fn new(logger: Logger, config: LoggingConfig) -> Self {
        Self {
            logger,
            config: Arc::new(config),
        }
    }

    /// Build the slog drain described by `config`.
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self::new(create_logger(&config.to_logger_config()), config.clone())
    }

    /// A logger that drops every record.
    pub fn discard() -> Self {
        Self::new(discard_logger(), LoggingConfig::default())
    }

    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    /// Collect both body copies in the background and emit the record once
    /// the response has finished streaming.
    pub fn capture(
        &self,
        pending: PendingRecord,
        status: u16,
        response_headers: HeaderMap,
        request_copy: BodyCopy,
        response_copy: BodyCopy,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let limit = this.config.max_body_size;
            let ((request_body, request_body_size), (response_body, response_body_size)) =
                tokio::join!(request_copy.collect(limit), response_copy.collect(limit));

            let record = LogRecord {
                request_id: pending.request_id,
                received_at: pending.received_at,
                duration: pending.started.elapsed(),
                status,
                method: pending.method,
                path: pending.path,
                query: pending.query,
                host: pending.host,
                remote_addr: pending.remote_addr,
                user_agent: pending.user_agent,
                request_headers: pending.request_headers,
                response_headers,
                request_body,
                response_body,
                request_body_size,
                response_body_size,
            };
            this.emit(&record);
        })
    }

    /// Write `record` to the drain.
    pub fn emit(&self, record: &LogRecord) {
        let request_body = if self.config.log_request_body {
            String::from_utf8_lossy(&record.request_body).into_owned()
        } else {
            String::new()
        };
        let response_body = if self.config.log_response_body {
            String::from_utf8_lossy(&record.response_body).into_owned()
        } else {
            String::new()
        };

        slog::info!(self.logger, "request completed";
            "request_id" => &record.request_id,
            "received_at" => record.received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "duration_ms" => record.duration.as_secs_f64() * 1000.0,
            "status" => record.status,
            "method" => &record.method,
            "path" => &record.path,
            "query" => record.query.as_deref().unwrap_or(""),
            "host" => &record.host,
            "remote_addr" => record.remote_addr.as_deref().unwrap_or("-"),
            "user_agent" => record.user_agent.as_deref().unwrap_or("-"),
            "request_headers" => headers_json(&record.request_headers),
            "response_headers" => headers_json(&record.response_headers),
            "request_body" => request_body,
            "request_body_size" => record.request_body_size,
            "response_body" => response_body,
            "response_body_size" => record.response_body_size,
        );
    }
}

/// Render headers as a JSON object; repeated headers become arrays.
fn headers_json(headers: &HeaderMap) -> String {
    let mut map: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name.as_str())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    let json: serde_json::Map<String, serde_json::Value> = map
        .into_iter()
        .map(|(name, mut values)| {
            let value = if values.len() == 1 {
                serde_json::Value::String(values.remove(0))
            } else {
                serde_json::Value::from(values)
            };
            (name.to_string(), value)
        })
        .collect();
    serde_json::Value::Object(json).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use reqwest::header::HeaderValue;
    use slog::{Drain, KV, Key, Never, OwnedKVList, Record, Serializer, o};
    use std::collections::HashMap;
    use std::fmt;
    use std::sync::Mutex;

    type Captured = Arc<Mutex<Vec<HashMap<String, String>>>>;

    #[derive(Default)]
    struct Fields(HashMap<String, String>);

    impl Serializer for Fields {
        fn emit_arguments(&mut self, key: Key, val: &fmt::Arguments) -> slog::Result {
            self.0.insert(key.to_string(), val.to_string());
            Ok(())
        }
    }

    struct CaptureDrain(Captured);

    impl Drain for CaptureDrain {
        type Ok = ();
        type Err = Never;

        fn log(&self, record: &Record, _values: &OwnedKVList) -> Result<(), Never> {
            let mut fields = Fields::default();
            let _ = record.kv().serialize(record, &mut fields);
            fields.0.insert("msg".to_string(), record.msg().to_string());
            self.0.lock().unwrap().push(fields.0);
            Ok(())
        }
    }

    fn capturing(config: LoggingConfig) -> (RequestLogger, Captured) {
        let captured = Captured::default();
        let logger = Logger::root(CaptureDrain(captured.clone()), o!());
        (RequestLogger::new(logger, config), captured)
    }

    async fn drain(body: reqwest::Body) -> Bytes {
        body.collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_tee_body_duplicates_chunks() {
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let body = reqwest::Body::wrap_stream(futures_util::stream::iter(chunks));

        let (body, copy) = tee_body(body);
        assert_eq!(drain(body).await, "hello world");

        let (captured, total) = copy.collect(1024).await;
        assert_eq!(captured, "hello world");
        assert_eq!(total, 11);
    }

    #[tokio::test]
    async fn test_copy_truncated_not_original() {
        let (body, copy) = tee_body(reqwest::Body::from("0123456789"));
        assert_eq!(drain(body).await, "0123456789");

        let (captured, total) = copy.collect(4).await;
        assert_eq!(captured, "0123");
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn test_dropped_body_closes_copy() {
        let (body, copy) = tee_body(reqwest::Body::from("never read"));
        drop(body);

        let (captured, total) = copy.collect(1024).await;
        assert!(captured.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_capture_emits_one_record_after_response_finishes() {
        let (logger, captured) = capturing(LoggingConfig::default());

        let mut request = ProxyRequest::new(Method::POST, "/orders?x=1")
            .with_header("user-agent", "curl/8")
            .with_header("host", "proxy.local")
            .with_body("{\"qty\":2}");
        request.context.client_addr = Some("10.1.2.3:4567".parse().unwrap());
        let pending = PendingRecord::from_request(&request);

        let (request_body, request_copy) = tee_body(request.body);
        let (response_body, response_copy) = tee_body(reqwest::Body::from("accepted"));

        let mut response_headers = HeaderMap::new();
        response_headers.insert("x-upstream", HeaderValue::from_static("a"));
        response_headers.append("x-upstream", HeaderValue::from_static("b"));

        let handle = logger.capture(pending, 201, response_headers, request_copy, response_copy);

        assert_eq!(drain(request_body).await, "{\"qty\":2}");
        assert!(captured.lock().unwrap().is_empty());
        assert_eq!(drain(response_body).await, "accepted");

        handle.await.unwrap();
        let records = captured.lock().unwrap();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record["msg"], "request completed");
        assert_eq!(record["status"], "201");
        assert_eq!(record["method"], "POST");
        assert_eq!(record["path"], "/orders");
        assert_eq!(record["query"], "x=1");
        assert_eq!(record["host"], "proxy.local");
        assert_eq!(record["remote_addr"], "10.1.2.3:4567");
        assert_eq!(record["user_agent"], "curl/8");
        assert_eq!(record["request_body"], "{\"qty\":2}");
        assert_eq!(record["response_body"], "accepted");
        assert_eq!(record["response_headers"], r#"{"x-upstream":["a","b"]}"#);
        assert_eq!(record["request_id"].len(), 36);
        assert!(DateTime::parse_from_rfc3339(&record["received_at"]).is_ok());
    }

    #[tokio::test]
    async fn test_bodies_omitted_when_disabled() {
        let config = LoggingConfig {
            log_request_body: false,
            log_response_body: false,
            ..LoggingConfig::default()
        };
        let (logger, captured) = capturing(config);

        let request = ProxyRequest::new(Method::GET, "/").with_body("secret");
        let pending = PendingRecord::from_request(&request);
        let (request_body, request_copy) = tee_body(request.body);
        let (response_body, response_copy) = tee_body(reqwest::Body::from("also secret"));

        let handle = logger.capture(pending, 200, HeaderMap::new(), request_copy, response_copy);
        drop(request_body);
        drain(response_body).await;
        handle.await.unwrap();

        let records = captured.lock().unwrap();
        assert_eq!(records[0]["request_body"], "");
        assert_eq!(records[0]["response_body"], "");
        assert_eq!(records[0]["response_body_size"], "11");
    }
}

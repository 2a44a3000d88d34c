//! HTTP-over-WebSocket proxying to workers.
//!
//! A [`Dispatch`] owns one request in flight on one worker: the reserved
//! slot, the pending waiter and the cancel-on-drop obligation. Dropping it at
//! any point (client went away, timeout, error) releases all three.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{stream, Stream};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use workpool_common::{BrokerMessage, ProxyError, WorkerMessage};

use super::registry::{SendError, Worker};
use super::scheduler::WorkerLease;
use crate::config::GatewayConfig;
use crate::error::BrokerError;

/// Header carrying the client-visible request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Body written when a worker fails before producing any bytes.
const UPSTREAM_ERROR_BODY: &[u8] = br#"{"error":"upstream_error"}"#;

/// Client request headers forwarded to workers.
const FORWARDED_HEADERS: [HeaderName; 3] = [
    axum::http::header::ACCEPT,
    axum::http::header::ACCEPT_LANGUAGE,
    axum::http::header::USER_AGENT,
];

/// An HTTP request to run on a worker.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub stream: bool,
    pub body: Vec<u8>,
}

impl ProxyRequest {
    /// A `POST` carrying a JSON body and the forwarded subset of `client_headers`.
    pub fn post(path: &str, client_headers: &HeaderMap, stream: bool, body: Vec<u8>) -> Self {
        Self {
            method: "POST".to_string(),
            path: path.to_string(),
            headers: forward_headers(client_headers),
            stream,
            body,
        }
    }
}

/// Pick the client headers a worker gets to see.
pub fn forward_headers(client: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    let content_type = client
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    headers.insert("Content-Type".to_string(), content_type.to_string());

    for name in FORWARDED_HEADERS.iter() {
        if let Some(value) = client.get(name).and_then(|v| v.to_str().ok()) {
            headers.insert(canonical(name.as_str()), value.to_string());
        }
    }

    let request_id = client
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    headers.insert("X-Request-Id".to_string(), request_id);
    headers.insert("Cache-Control".to_string(), "no-store".to_string());
    headers
}

/// `accept-language` -> `Accept-Language`.
fn canonical(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Per-request time limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyTimeouts {
    /// Idle limit between frames, extended while the worker heartbeats.
    pub idle: Option<Duration>,
    /// Absolute limit regardless of heartbeats.
    pub hard: Option<Duration>,
}

impl From<&GatewayConfig> for ProxyTimeouts {
    fn from(config: &GatewayConfig) -> Self {
        let idle = config.request_timeout();
        Self {
            idle: (!idle.is_zero()).then_some(idle),
            hard: config.hard_timeout(),
        }
    }
}

enum Frame {
    Msg(WorkerMessage),
    Closed,
    TimedOut,
}

/// One request dispatched to a worker.
pub struct Dispatch {
    lease: WorkerLease,
    request_id: String,
    rx: mpsc::Receiver<WorkerMessage>,
    timeouts: ProxyTimeouts,
    hard_deadline: Option<Instant>,
    model: String,
    started: Instant,
    finished: bool,
}

impl Dispatch {
    /// Register a waiter and enqueue `req` on the leased worker.
    ///
    /// A full outbound queue yields [`BrokerError::WorkerBusy`]; the lease is
    /// dropped so the reserved slot is given back.
    pub fn start(
        lease: WorkerLease,
        req: ProxyRequest,
        timeouts: ProxyTimeouts,
        model: &str,
    ) -> Result<Self, BrokerError> {
        let worker = lease.worker().clone();
        let request_id = uuid::Uuid::new_v4().to_string();
        let rx = worker
            .register_pending(&request_id)
            .ok_or(BrokerError::WorkerBusy)?;

        let stream = req.stream;
        let msg = BrokerMessage::HttpProxyRequest {
            request_id: request_id.clone(),
            method: req.method,
            path: req.path,
            headers: req.headers,
            stream,
            body: req.body,
        };
        if let Err(e) = worker.send(msg) {
            worker.remove_pending(&request_id);
            return Err(match e {
                SendError::Full => {
                    tracing::warn!(worker_id = %worker.id, worker_name = %worker.name, model, "Worker busy");
                    BrokerError::WorkerBusy
                }
                SendError::Closed => BrokerError::Upstream("worker disconnected".to_string()),
            });
        }

        tracing::info!(
            request_id = %request_id,
            worker_id = %worker.id,
            worker_name = %worker.name,
            model,
            stream,
            "Dispatched request"
        );

        let started = Instant::now();
        Ok(Self {
            lease,
            request_id,
            rx,
            timeouts,
            hard_deadline: timeouts.hard.map(|hard| started + hard),
            model: model.to_string(),
            started,
            finished: false,
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn worker(&self) -> &Arc<Worker> {
        self.lease.worker()
    }

    /// Wait for the next frame, applying the idle and hard limits.
    async fn next_frame(&mut self) -> Frame {
        let Some(idle) = self.timeouts.idle else {
            return match self.hard_deadline {
                Some(hard) => match timeout_at(hard, self.rx.recv()).await {
                    Ok(Some(msg)) => Frame::Msg(msg),
                    Ok(None) => Frame::Closed,
                    Err(_) => Frame::TimedOut,
                },
                None => self.rx.recv().await.map_or(Frame::Closed, Frame::Msg),
            };
        };

        let mut deadline = Instant::now() + idle;
        loop {
            let limit = self.hard_deadline.map_or(deadline, |hard| hard.min(deadline));
            match timeout_at(limit, self.rx.recv()).await {
                Ok(Some(msg)) => return Frame::Msg(msg),
                Ok(None) => return Frame::Closed,
                Err(_) => {
                    if self.hard_deadline.is_some_and(|hard| Instant::now() >= hard) {
                        return Frame::TimedOut;
                    }
                    // A worker that still heartbeats is slow, not dead.
                    let since = self.worker().heartbeat_age();
                    if since >= idle {
                        return Frame::TimedOut;
                    }
                    deadline = Instant::now() + (idle - since);
                }
            }
        }
    }

    fn log_upstream_error(&self, err: &ProxyError) {
        tracing::error!(
            request_id = %self.request_id,
            worker_id = %self.worker().id,
            model = %self.model,
            error_code = %err.code,
            error = %err.message,
            "Upstream error"
        );
    }

    fn log_complete(&self) {
        tracing::info!(
            request_id = %self.request_id,
            worker_id = %self.worker().id,
            model = %self.model,
            duration_ms = self.started.elapsed().as_millis() as u64,
            "Request complete"
        );
    }

    fn log_timeout(&self) {
        tracing::warn!(
            request_id = %self.request_id,
            worker_id = %self.worker().id,
            model = %self.model,
            "Request timed out"
        );
    }

    /// Turn the worker's reply into a streamed HTTP response.
    ///
    /// Errors that arrive before the response head become JSON errors; after
    /// that the status is fixed and only the body can still change.
    pub async fn into_response(mut self) -> Response {
        loop {
            match self.next_frame().await {
                Frame::Msg(WorkerMessage::HttpProxyResponseHeaders { status, headers, .. }) => {
                    let mut response = Response::new(Body::from_stream(self.body_stream(None)));
                    apply_head(&mut response, status, &headers);
                    return response;
                }
                Frame::Msg(WorkerMessage::HttpProxyResponseChunk { data, .. }) => {
                    return Response::new(Body::from_stream(self.body_stream(Some(data))));
                }
                Frame::Msg(WorkerMessage::HttpProxyResponseEnd { error, .. }) => {
                    self.finished = true;
                    return match error {
                        Some(err) => {
                            self.log_upstream_error(&err);
                            BrokerError::Upstream(err.message).into_response()
                        }
                        None => {
                            self.log_complete();
                            StatusCode::OK.into_response()
                        }
                    };
                }
                Frame::Msg(_) => continue,
                Frame::Closed => {
                    return BrokerError::Upstream("upstream closed".to_string()).into_response();
                }
                Frame::TimedOut => {
                    self.log_timeout();
                    return BrokerError::Timeout.into_response();
                }
            }
        }
    }

    /// Body frames after the head, ending at the terminal frame.
    fn body_stream(self, first: Option<Vec<u8>>) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
        struct BodyState {
            dispatch: Dispatch,
            first: Option<Bytes>,
            bytes_sent: bool,
            done: bool,
        }

        let state = BodyState {
            dispatch: self,
            first: first.filter(|d| !d.is_empty()).map(Bytes::from),
            bytes_sent: false,
            done: false,
        };

        stream::unfold(state, |mut st| async move {
            if let Some(first) = st.first.take() {
                st.bytes_sent = true;
                return Some((Ok(first), st));
            }
            if st.done {
                return None;
            }
            loop {
                match st.dispatch.next_frame().await {
                    Frame::Msg(WorkerMessage::HttpProxyResponseChunk { data, .. }) => {
                        if data.is_empty() {
                            continue;
                        }
                        st.bytes_sent = true;
                        return Some((Ok(Bytes::from(data)), st));
                    }
                    Frame::Msg(WorkerMessage::HttpProxyResponseEnd { error, .. }) => {
                        st.dispatch.finished = true;
                        st.done = true;
                        match error {
                            Some(err) => {
                                st.dispatch.log_upstream_error(&err);
                                if st.bytes_sent {
                                    return None;
                                }
                                return Some((Ok(Bytes::from_static(UPSTREAM_ERROR_BODY)), st));
                            }
                            None => {
                                st.dispatch.log_complete();
                                return None;
                            }
                        }
                    }
                    Frame::Msg(_) => continue,
                    // Fail the body so the client sees a truncated response, not a complete one.
                    Frame::Closed => {
                        tracing::warn!(request_id = %st.dispatch.request_id, "Upstream closed mid-response");
                        st.done = true;
                        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "upstream closed");
                        return Some((Err(err), st));
                    }
                    Frame::TimedOut => {
                        st.dispatch.log_timeout();
                        st.done = true;
                        let err = io::Error::new(io::ErrorKind::TimedOut, "upstream timed out");
                        return Some((Err(err), st));
                    }
                }
            }
        })
    }

    /// Buffer the whole reply. Used where responses are merged, not streamed.
    pub async fn collect(mut self) -> Result<(StatusCode, Vec<u8>), BrokerError> {
        let mut status = StatusCode::OK;
        let mut body = Vec::new();
        loop {
            match self.next_frame().await {
                Frame::Msg(WorkerMessage::HttpProxyResponseHeaders { status: s, .. }) => {
                    status = StatusCode::from_u16(s).unwrap_or(StatusCode::BAD_GATEWAY);
                }
                Frame::Msg(WorkerMessage::HttpProxyResponseChunk { data, .. }) => {
                    body.extend_from_slice(&data);
                }
                Frame::Msg(WorkerMessage::HttpProxyResponseEnd { error, .. }) => {
                    self.finished = true;
                    if let Some(err) = error {
                        self.log_upstream_error(&err);
                        return Err(BrokerError::Upstream(err.message));
                    }
                    self.log_complete();
                    return Ok((status, body));
                }
                Frame::Msg(_) => continue,
                Frame::Closed => return Err(BrokerError::Upstream("upstream closed".to_string())),
                Frame::TimedOut => {
                    self.log_timeout();
                    return Err(BrokerError::Timeout);
                }
            }
        }
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        let worker = self.lease.worker();
        worker.remove_pending(&self.request_id);
        if !self.finished {
            let cancel = BrokerMessage::HttpProxyCancel {
                request_id: self.request_id.clone(),
            };
            match worker.send(cancel) {
                Ok(()) => tracing::debug!(request_id = %self.request_id, worker_id = %worker.id, "Sent cancel"),
                Err(e) => tracing::debug!(request_id = %self.request_id, "Cancel not sent: {}", e),
            }
        }
    }
}

/// Copy a worker's status line and headers onto `response`.
fn apply_head(response: &mut Response, status: u16, headers: &HashMap<String, String>) {
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);

    let out = response.headers_mut();
    for (key, value) in headers {
        let (Ok(name), Ok(value)) = (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(value)) else {
            tracing::debug!(header = %key, "Skipping invalid upstream header");
            continue;
        };
        if name == TRANSFER_ENCODING || name == CONNECTION || name == CONTENT_LENGTH {
            continue;
        }
        out.insert(name, value);
    }

    let event_stream = out
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/event-stream"));
    if event_stream {
        out.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
}

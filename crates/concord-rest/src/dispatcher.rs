//! Rate-limit-aware request dispatcher.
//!
//! Serializes calls per normalized route through [`RateBucket`]s, tracks
//! the server's quota headers, honors account-wide throttling, and retries
//! transient failures (429, 502) without surfacing them to the caller.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::bucket::RateBucket;
use crate::error::RestError;
use crate::latency::LatencyEstimator;
use crate::routes::Route;

/// Default hard budget for one attempt, covering both the send and the
/// body read. Retries restart their own budget.
const ATTEMPT_TIMEOUT_MS: u64 = 15_000;

/// Additional attempts allowed after a 502 before the call fails.
const MAX_BAD_GATEWAY_RETRIES: u32 = 3;

/// Percent-encoding set matching JS `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

// ── Configuration ────────────────────────────────────────────

/// Immutable configuration for the dispatcher, constructed once at
/// startup and passed by reference.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Authorization header value, sent verbatim on authenticated calls.
    pub token: String,
    /// Base URL prefixed to every request path.
    pub base_url: String,
    /// User-Agent header value.
    pub user_agent: String,
    /// Hard budget for one attempt in milliseconds, shared by the send
    /// and the body read. Each retry restarts the budget.
    pub attempt_timeout_ms: u64,
}

impl RestConfig {
    /// Configuration with default endpoint and user agent.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: "https://discord.com/api/v9".to_owned(),
            user_agent: concat!("concord (", env!("CARGO_PKG_VERSION"), ")").to_owned(),
            attempt_timeout_ms: ATTEMPT_TIMEOUT_MS,
        }
    }
}

// ── Response body ────────────────────────────────────────────

/// Decoded response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Parsed JSON body.
    Json(Value),
    /// Raw bytes for non-JSON content types.
    Raw(Vec<u8>),
    /// Empty body (204 and friends).
    Empty,
}

impl ResponseBody {
    /// The parsed JSON value, if this body was JSON.
    #[must_use]
    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Raw(_) | Self::Empty => None,
        }
    }
}

// ── Global throttle ──────────────────────────────────────────

/// Account-wide rate limit shared by all routes.
///
/// Once set, new authenticated dispatches queue behind the flag until the
/// single owning timer clears it; calls already admitted to a bucket are
/// unaffected.
#[derive(Debug, Default)]
struct GlobalThrottle {
    blocked: AtomicBool,
    waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl GlobalThrottle {
    /// Park until the throttle clears. Returns immediately when unset.
    async fn wait_if_blocked(&self) {
        loop {
            if !self.blocked.load(Ordering::Acquire) {
                return;
            }
            let rx = {
                let Ok(mut waiters) = self.waiters.lock() else {
                    return;
                };
                // Re-check under the lock so an unblock between the fast
                // check and the enqueue cannot strand this waiter.
                if !self.blocked.load(Ordering::Acquire) {
                    return;
                }
                let (tx, rx) = oneshot::channel();
                waiters.push_back(tx);
                rx
            };
            let _ = rx.await;
        }
    }

    /// Set the throttle. The first setter spawns the one timer that
    /// clears it; later calls while blocked are no-ops.
    fn block_for(self: &Arc<Self>, delay: Duration) {
        if self
            .blocked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(delay_ms = delay.as_millis(), "Global throttle engaged");
            let throttle = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                throttle.unblock();
            });
        }
    }

    /// Clear the flag and release parked calls in submission order.
    fn unblock(&self) {
        self.blocked.store(false, Ordering::Release);
        let drained: Vec<_> = self
            .waiters
            .lock()
            .map(|mut w| w.drain(..).collect())
            .unwrap_or_default();
        debug!(released = drained.len(), "Global throttle cleared");
        for tx in drained {
            let _ = tx.send(());
        }
    }
}

// ── Dispatcher ───────────────────────────────────────────────

/// What to do after one attempt.
enum Attempt {
    Done(ResponseBody),
    /// 429: transparently re-submit after the delay, with priority.
    RateLimited { delay: Duration },
    /// 502: retry with randomized backoff.
    BadGateway,
}

/// Issues HTTP calls serialized per route, with quota tracking and
/// transparent retry of transient failures.
#[derive(Debug)]
pub struct RequestDispatcher {
    config: RestConfig,
    http: reqwest::Client,
    buckets: DashMap<String, Arc<RateBucket>>,
    latency: LatencyEstimator,
    global: Arc<GlobalThrottle>,
}

impl RequestDispatcher {
    /// Build a dispatcher from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: RestConfig) -> Result<Self, RestError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            config,
            http,
            buckets: DashMap::new(),
            latency: LatencyEstimator::default(),
            global: Arc::new(GlobalThrottle::default()),
        })
    }

    /// Make an API request.
    ///
    /// Rate limits are handled internally: the caller sees only added
    /// latency, never a 429. For GET/DELETE, `body` fields become query
    /// parameters (arrays expand to repeated keys). A `reason` field in
    /// the body becomes the audit-log header and is removed from the body
    /// except for ban/prune endpoints.
    ///
    /// # Errors
    ///
    /// Surfaces [`RestError::Api`] for structured remote errors,
    /// [`RestError::Http`] for other non-success statuses,
    /// [`RestError::Timeout`] when a single attempt exceeds its budget
    /// (15s by default), and transport/parse failures as-is.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        authenticated: bool,
        mut body: Option<Value>,
    ) -> Result<ResponseBody, RestError> {
        let route = Route::new(&method, path);
        let reason = extract_reason(&method, path, body.as_mut());

        let mut bad_gateway_attempts: u32 = 0;
        let mut priority = false;

        loop {
            if authenticated {
                self.global.wait_if_blocked().await;
            }

            let bucket = self.bucket(&route);
            let slot = bucket
                .acquire(priority)
                .await
                .ok_or(RestError::Dropped)?;

            let outcome = self
                .attempt(&method, path, authenticated, body.as_ref(), reason.as_deref(), &route, &bucket)
                .await;
            drop(slot);

            match outcome? {
                Attempt::Done(response) => return Ok(response),
                Attempt::RateLimited { delay } => {
                    priority = true;
                    tokio::time::sleep(delay).await;
                },
                Attempt::BadGateway => {
                    bad_gateway_attempts = bad_gateway_attempts.saturating_add(1);
                    if bad_gateway_attempts > MAX_BAD_GATEWAY_RETRIES {
                        return Err(RestError::Http {
                            status: 502,
                            body: String::new(),
                            method: method.to_string(),
                            path: path.to_owned(),
                        });
                    }
                    debug!(route = %route, attempt = bad_gateway_attempts, "502, retrying");
                    priority = true;
                    tokio::time::sleep(Duration::from_millis(fastrand::u64(100..2000))).await;
                },
            }
        }
    }

    /// Resolve or lazily create the bucket for a route. Buckets live for
    /// the process lifetime.
    fn bucket(&self, route: &Route) -> Arc<RateBucket> {
        self.buckets
            .entry(route.key().to_owned())
            .or_insert_with(|| Arc::new(RateBucket::new(route.key().to_owned())))
            .clone()
    }

    /// One attempt: send, record timing, update quota, classify status.
    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    async fn attempt(
        &self,
        method: &Method,
        path: &str,
        authenticated: bool,
        body: Option<&Value>,
        reason: Option<&str>,
        route: &Route,
        bucket: &RateBucket,
    ) -> Result<Attempt, RestError> {
        let url = format!("{}{path}", self.config.base_url);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .headers(self.build_headers(authenticated, reason));

        if let Some(body) = body {
            if *method == Method::GET || *method == Method::DELETE {
                request = request.query(&query_pairs(body));
            } else {
                request = request.json(body);
            }
        }

        let started = Instant::now();
        // One deadline covers the whole attempt: the body read gets only
        // what the send left of the budget.
        let deadline = started + Duration::from_millis(self.config.attempt_timeout_ms);
        let response = match tokio::time::timeout_at(deadline, request.send()).await {
            Ok(result) => result?,
            Err(_) => return Err(self.timeout_error(method, path)),
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        self.latency.record_latency(latency_ms);

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let server_date_ms = parse_date_header(&headers);
        if let Some(server_ms) = server_date_ms {
            self.latency.record_offset(epoch_millis().saturating_sub(server_ms));
        }

        let retry_delay = self.update_quota(route, bucket, method, &headers, server_date_ms);

        if status == 429 {
            let global = headers.contains_key("x-ratelimit-global");
            let delay = retry_delay.unwrap_or(Duration::from_millis(1));
            if global {
                warn!(route = %route, delay_ms = delay.as_millis(), "Global 429");
                self.global.block_for(delay);
            } else {
                warn!(route = %route, delay_ms = delay.as_millis(), "Unexpected 429");
            }
            return Ok(Attempt::RateLimited { delay });
        }

        if status == 502 {
            return Ok(Attempt::BadGateway);
        }

        let is_json = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));
        let bytes = match tokio::time::timeout_at(deadline, response.bytes()).await {
            Ok(result) => result?,
            Err(_) => return Err(self.timeout_error(method, path)),
        };

        if status >= 300 {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if is_json {
                if let Ok(parsed) = serde_json::from_slice::<Value>(&bytes) {
                    if let Some(code) = parsed.get("code").and_then(Value::as_i64) {
                        return Err(RestError::Api {
                            code,
                            message: parsed
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned(),
                            status,
                            method: method.to_string(),
                            path: path.to_owned(),
                        });
                    }
                }
            }
            return Err(RestError::Http {
                status,
                body: text,
                method: method.to_string(),
                path: path.to_owned(),
            });
        }

        trace!(
            route = %route,
            status,
            latency_ms,
            avg_latency_ms = self.latency.latency(),
            "Request complete"
        );

        if bytes.is_empty() {
            return Ok(Attempt::Done(ResponseBody::Empty));
        }
        if is_json {
            // Parse failure on a success body is terminal, never retried.
            let value = serde_json::from_slice(&bytes)?;
            return Ok(Attempt::Done(ResponseBody::Json(value)));
        }
        Ok(Attempt::Done(ResponseBody::Raw(bytes.to_vec())))
    }

    /// Per-call immutable header set.
    fn build_headers(&self, authenticated: bool, reason: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(ua) = HeaderValue::from_str(&self.config.user_agent) {
            headers.insert(reqwest::header::USER_AGENT, ua);
        }
        if authenticated {
            if let Ok(mut auth) = HeaderValue::from_str(&self.config.token) {
                auth.set_sensitive(true);
                headers.insert(reqwest::header::AUTHORIZATION, auth);
            }
        }
        if let Some(reason) = reason {
            let encoded = utf8_percent_encode(reason, COMPONENT).to_string();
            if let Ok(value) = HeaderValue::from_str(&encoded) {
                headers.insert("x-audit-log-reason", value);
            }
        }
        headers
    }

    /// Read the quota headers, push the bucket's state forward, and set
    /// the global throttle if the response demands it. Returns the retry
    /// delay advertised by a relative reset header, if any.
    fn update_quota(
        &self,
        route: &Route,
        bucket: &RateBucket,
        method: &Method,
        headers: &HeaderMap,
        server_date_ms: Option<i64>,
    ) -> Option<Duration> {
        let limit = header_u64(headers, "x-ratelimit-limit");
        let remaining_header = header_u64(headers, "x-ratelimit-remaining");

        if *method != Method::GET
            && (remaining_header.is_none() || limit.is_none())
            && bucket.known_limit() != 1
        {
            // The server omitted headers it normally sends for this route.
            warn!(
                route = %route,
                ?limit,
                ?remaining_header,
                "Missing rate limit headers on bucket with non-default limit"
            );
        }

        let remaining = remaining_header.unwrap_or(1);

        let retry_after = header_f64(headers, "x-ratelimit-reset-after")
            .or_else(|| header_f64(headers, "retry-after"))
            .map(|secs| Duration::from_millis((secs * 1000.0).max(0.0) as u64));

        let reset_at = if let Some(delay) = retry_after {
            if headers.contains_key("x-ratelimit-global") {
                // Global limits do not move this route's own window.
                None
            } else {
                Some(Instant::now() + delay.max(Duration::from_millis(1)))
            }
        } else if let Some(reset_epoch_secs) = header_f64(headers, "x-ratelimit-reset") {
            let reset_epoch_ms = (reset_epoch_secs * 1000.0) as i64;
            Some(self.absolute_reset(route, reset_epoch_ms, server_date_ms))
        } else {
            Some(Instant::now())
        };

        bucket.update_quota(limit, remaining, reset_at);
        retry_after
    }

    fn timeout_error(&self, method: &Method, path: &str) -> RestError {
        RestError::Timeout {
            timeout_ms: self.config.attempt_timeout_ms,
            method: method.to_string(),
            path: path.to_owned(),
        }
    }

    /// Convert an absolute epoch reset into a safe local deadline,
    /// compensating for clock skew and measured latency.
    fn absolute_reset(
        &self,
        route: &Route,
        reset_epoch_ms: i64,
        server_date_ms: Option<i64>,
    ) -> Instant {
        // Known skew on the reaction endpoint: an advertised reset exactly
        // one second past the server date really clears in ~250ms.
        if route.key().ends_with("/reactions/:id")
            && server_date_ms.is_some_and(|date| reset_epoch_ms.saturating_sub(date) == 1000)
        {
            return Instant::now() + Duration::from_millis(250);
        }

        let local_target_ms = reset_epoch_ms
            .saturating_add(self.latency.offset())
            .saturating_sub(self.latency.latency() as i64);
        let delta_ms = local_target_ms.saturating_sub(epoch_millis()).max(0);
        Instant::now() + Duration::from_millis(delta_ms as u64)
    }
}

// ── Helpers ──────────────────────────────────────────────────

/// Pull the audit reason out of the body: decoded defensively, destined
/// for the audit-log header. Stays in the body only for ban/prune-style
/// endpoints whose remote reads it from the payload.
fn extract_reason(method: &Method, path: &str, body: Option<&mut Value>) -> Option<String> {
    let body = body?;
    let obj = body.as_object_mut()?;
    let raw = obj.get("reason")?.as_str()?.to_owned();

    let decoded = if raw.contains('%') && !raw.contains(' ') {
        percent_decode_str(&raw)
            .decode_utf8()
            .map_or(raw.clone(), |s| s.into_owned())
    } else {
        raw.clone()
    };

    let keep_in_body = (path.contains("/bans") && *method != Method::PUT)
        || (path.contains("/prune") && *method == Method::POST);
    if keep_in_body {
        obj.insert("reason".to_owned(), Value::String(decoded.clone()));
    } else {
        obj.remove("reason");
    }

    Some(decoded)
}

/// Expand a JSON object into query pairs; array values repeat the key.
fn query_pairs(body: &Value) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let Some(obj) = body.as_object() else {
        return pairs;
    };
    for (key, value) in obj {
        match value {
            Value::Null => {},
            Value::Array(items) => {
                for item in items {
                    pairs.push((key.clone(), scalar_string(item)));
                }
            },
            other => pairs.push((key.clone(), scalar_string(other))),
        }
    }
    pairs
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn parse_date_header(headers: &HeaderMap) -> Option<i64> {
    let date = headers.get(reqwest::header::DATE)?.to_str().ok()?;
    chrono::DateTime::parse_from_rfc2822(date)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

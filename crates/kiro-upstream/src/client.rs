//! Upstream Client (spec §4.F): HTTP transport to the Kiro/CodeWhisperer
//! backend, machine-id header derivation, 403-refresh-once, and
//! 429/5xx/transient backoff retry. Grounded on
//! `gproxy-core::upstream_client::WreqUpstreamClient`'s `wreq`-backed
//! client-per-proxy cache and response-to-stream bridging, narrowed to
//! Kiro's single wire protocol and widened with the credential-refresh and
//! retry policy spec §4.F adds on top of what that teacher file did.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{Stream, StreamExt};
use kiro_credential::UpstreamCredentials;
use kiro_protocol::canonical::{CanonicalRequest, CanonicalStreamEvent, CanonicalToolCall, CanonicalUsage, StopReason};
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::UpstreamError;
use crate::eventstream::EventStreamCodec;
use crate::request::{build_conversation_state, chat_endpoint, usage_endpoint};

pub type CanonicalEventStream = Pin<Box<dyn Stream<Item = CanonicalStreamEvent> + Send>>;

/// Forces a refresh of `cred` regardless of its claimed expiry (spec §4.F
/// "403 once → force refresh"). Implemented by `kiro-core` over
/// `kiro_credential::CredentialManager` — kept as a trait here so this
/// crate doesn't depend on the Pool Selector/Credential Manager wiring
/// (spec §9 "Upstream Client takes a credential handle plus a refresh-now
/// callback, not the manager").
pub trait CredentialRefresher: Send + Sync {
    fn force_refresh<'a>(
        &'a self,
        upstream_id: i64,
        cred: &'a UpstreamCredentials,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamCredentials, UpstreamError>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            // spec §4.F `AXIOS_TIMEOUT`.
            request_timeout: Duration::from_secs(300),
            stream_idle_timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

pub struct UpstreamCallResult {
    pub text: String,
    /// Codec-derived tool calls only — text-marker reconstruction happens
    /// one layer up, where `kiro-transform` is available.
    pub tool_calls: Vec<CanonicalToolCall>,
    pub usage: CanonicalUsage,
    pub stop_reason: StopReason,
}

pub struct KiroUpstreamClient {
    http: wreq::Client,
    config: UpstreamClientConfig,
}

impl KiroUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, UpstreamError> {
        let http = wreq::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout)
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(Self { http, config })
    }

    /// Drives a full non-stream call by exhausting the event stream and
    /// concatenating its text/tool-call/usage output (spec §4.F `Call`).
    pub async fn call(
        &self,
        upstream_id: i64,
        upstream_uuid: &str,
        cred: UpstreamCredentials,
        refresher: &dyn CredentialRefresher,
        req: &CanonicalRequest,
    ) -> Result<UpstreamCallResult, UpstreamError> {
        let mut events = self.stream(upstream_id, upstream_uuid, cred, refresher, req).await?;
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = CanonicalUsage::default();
        let mut stop_reason = StopReason::EndTurn;
        while let Some(event) = events.next().await {
            match event {
                CanonicalStreamEvent::TextDelta(delta) => text.push_str(&delta),
                CanonicalStreamEvent::ToolCall(call) => tool_calls.push(call),
                CanonicalStreamEvent::Done { usage: u, stop_reason: sr } => {
                    usage = u;
                    stop_reason = sr;
                }
                CanonicalStreamEvent::Error(message) => return Err(UpstreamError::Transport(message)),
            }
        }
        Ok(UpstreamCallResult { text, tool_calls, usage, stop_reason })
    }

    /// Streams canonical events as they decode off the wire (spec §4.F
    /// `Stream`). Failures before the first byte are retried per policy;
    /// failures after streaming has started are reported as a terminal
    /// `CanonicalStreamEvent::Error` rather than retried (spec §4.F
    /// "Streaming failures after first byte not retried").
    pub async fn stream(
        &self,
        upstream_id: i64,
        upstream_uuid: &str,
        mut cred: UpstreamCredentials,
        refresher: &dyn CredentialRefresher,
        req: &CanonicalRequest,
    ) -> Result<CanonicalEventStream, UpstreamError> {
        let endpoint = chat_endpoint(&cred.region, &req.model);
        let body = build_conversation_state(req, &cred);
        let resp = self
            .send_with_retry(upstream_id, upstream_uuid, &mut cred, refresher, &endpoint, &body)
            .await?;

        let idle_timeout = self.config.stream_idle_timeout;
        let (tx, rx) = tokio::sync::mpsc::channel::<CanonicalStreamEvent>(32);
        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut codec = EventStreamCodec::new();
            let mut saw_tool_call = false;
            loop {
                let next = match tokio::time::timeout(idle_timeout, byte_stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        let _ = tx.send(CanonicalStreamEvent::Error("upstream stream idle timeout".to_string())).await;
                        return;
                    }
                };
                let chunk = match next {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(err)) => {
                        let _ = tx.send(CanonicalStreamEvent::Error(err.to_string())).await;
                        return;
                    }
                    None => break,
                };
                for event in codec.push_bytes(&chunk) {
                    if matches!(event, CanonicalStreamEvent::ToolCall(_)) {
                        saw_tool_call = true;
                    }
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            let stop_reason = if saw_tool_call { StopReason::ToolUse } else { StopReason::EndTurn };
            let _ = tx.send(CanonicalStreamEvent::Done { usage: CanonicalUsage::default(), stop_reason }).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    pub async fn get_usage(
        &self,
        upstream_id: i64,
        upstream_uuid: &str,
        mut cred: UpstreamCredentials,
        refresher: &dyn CredentialRefresher,
    ) -> Result<Value, UpstreamError> {
        let url = usage_endpoint(&cred.region, cred.profile_arn.as_deref());
        let mut attempt = 0;
        let mut refreshed_on_403 = false;
        loop {
            let machine_id = machine_id_of(upstream_uuid, &cred);
            let mut req = self.http.get(&url);
            req = apply_common_headers(req, &cred, &machine_id);
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status == 403 && !refreshed_on_403 {
                        refreshed_on_403 = true;
                        cred = refresher.force_refresh(upstream_id, &cred).await?;
                        continue;
                    }
                    if should_retry_status(status) && attempt + 1 < self.config.max_retries {
                        attempt += 1;
                        tokio::time::sleep(self.config.base_delay * 2u32.pow(attempt - 1)).await;
                        continue;
                    }
                    if status >= 300 {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(status_to_error(status, body));
                    }
                    return resp.json::<Value>().await.map_err(|e| UpstreamError::Decode(e.to_string()));
                }
                Err(err) => {
                    if attempt + 1 >= self.config.max_retries {
                        return Err(classify_transport_error(&err));
                    }
                    attempt += 1;
                    tokio::time::sleep(self.config.base_delay * 2u32.pow(attempt - 1)).await;
                }
            }
        }
    }

    async fn send_with_retry(
        &self,
        upstream_id: i64,
        upstream_uuid: &str,
        cred: &mut UpstreamCredentials,
        refresher: &dyn CredentialRefresher,
        endpoint: &str,
        body: &Value,
    ) -> Result<wreq::Response, UpstreamError> {
        let mut attempt = 0;
        let mut refreshed_on_403 = false;
        loop {
            let machine_id = machine_id_of(upstream_uuid, cred);
            let mut req = self.http.post(endpoint).json(body);
            req = apply_common_headers(req, cred, &machine_id);
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status == 403 && !refreshed_on_403 {
                        refreshed_on_403 = true;
                        *cred = refresher.force_refresh(upstream_id, cred).await?;
                        continue;
                    }
                    if should_retry_status(status) && attempt + 1 < self.config.max_retries {
                        attempt += 1;
                        tokio::time::sleep(self.config.base_delay * 2u32.pow(attempt - 1)).await;
                        continue;
                    }
                    if status >= 300 {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(status_to_error(status, body));
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt + 1 >= self.config.max_retries {
                        return Err(classify_transport_error(&err));
                    }
                    attempt += 1;
                    tokio::time::sleep(self.config.base_delay * 2u32.pow(attempt - 1)).await;
                }
            }
        }
    }
}

fn apply_common_headers(req: wreq::RequestBuilder, cred: &UpstreamCredentials, machine_id: &str) -> wreq::RequestBuilder {
    req.header("authorization", format!("Bearer {}", cred.access_token))
        .header("amz-sdk-invocation-id", Uuid::new_v4().to_string())
        .header("amz-sdk-request", "attempt=1; max=1")
        .header("user-agent", format!("KiroGateway/1.0 md/machine-id#{machine_id}"))
        .header("x-amz-user-agent", format!("aws-sdk-js/1.0 KiroGateway md/machine-id#{machine_id}"))
}

/// spec §4.F: `SHA-256(uuid ∥ profileArn ∥ clientId ∥ "DEFAULT")`, used only
/// in the user-agent headers above.
fn machine_id_of(upstream_uuid: &str, cred: &UpstreamCredentials) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(upstream_uuid.as_bytes());
    hasher.update(cred.profile_arn.as_deref().unwrap_or("").as_bytes());
    hasher.update(cred.client_id.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"DEFAULT");
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn should_retry_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn status_to_error(status: u16, body: String) -> UpstreamError {
    match status {
        403 => UpstreamError::TokenExpired,
        429 => UpstreamError::RateLimited,
        500..=599 => UpstreamError::ServerError(status),
        _ => UpstreamError::Http { status, body },
    }
}

fn classify_transport_error(err: &wreq::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout
    } else {
        UpstreamError::Transport(err.to_string())
    }
}

//! Proxy Engine (spec §4.G): drives a canonical request through the Pool
//! Selector and Upstream Client, reconciling text-marker tool calls once the
//! codec's own calls are known. Dialect encoding/decoding happens in
//! `kiro-router`; this module never sees an OpenAI or Claude wire shape.

mod types;

use std::sync::Arc;

use futures_util::StreamExt;
use kiro_protocol::canonical::{CanonicalRequest, CanonicalStreamEvent, StopReason};
use kiro_upstream::CanonicalEventStream;

use crate::credential_refresher::ManagerRefresher;
use crate::error::GatewayError;
use crate::state::AppState;

pub use types::EngineResult;

pub struct ProxyEngine {
    state: Arc<AppState>,
}

impl ProxyEngine {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Non-stream path: retries across distinct upstreams on failure (spec
    /// §4.G), then reconciles any text-marker tool calls the codec itself
    /// didn't catch.
    pub async fn execute_nonstream(&self, req: &CanonicalRequest) -> Result<EngineResult, GatewayError> {
        let refresher = ManagerRefresher { manager: self.state.credential_manager.clone() };
        let store = &self.state.store;
        let upstream_client = &self.state.upstream_client;

        let result = self
            .state
            .selector
            .execute_with_retry(Some(req.model.as_str()), |id, cred| {
                let refresher = &refresher;
                async move {
                    let upstream = store
                        .get_upstream(id)
                        .await
                        .map_err(|e| e.to_string())?
                        .ok_or_else(|| format!("upstream {id} not found"))?;
                    upstream_client
                        .call(id, &upstream.uuid, cred, refresher, req)
                        .await
                        .map_err(|e| e.to_string())
                }
            })
            .await?;

        let reconciled = kiro_transform::toolcall::reconcile_tool_calls(&result.text, result.tool_calls);
        let stop_reason = if reconciled.is_empty() { result.stop_reason } else { StopReason::ToolUse };
        Ok(EngineResult { text: result.text, tool_calls: reconciled, usage: result.usage, stop_reason })
    }

    /// Stream path: acquires a single upstream and never retries once bytes
    /// flow (spec §4.F) — a mid-stream failure is reported to the selector
    /// and surfaces as a terminal `Error` event to the caller. Tool-call
    /// reconciliation runs once, against the fully-buffered text, right
    /// before `Done`.
    pub async fn execute_stream(&self, req: CanonicalRequest) -> Result<CanonicalEventStream, GatewayError> {
        let (id, cred) = self.state.selector.acquire(Some(&req.model)).await?;
        let upstream = self
            .state
            .store
            .get_upstream(id)
            .await?
            .ok_or(GatewayError::NoUpstreamAvailable)?;

        let refresher = ManagerRefresher { manager: self.state.credential_manager.clone() };
        let inner = self
            .state
            .upstream_client
            .stream(id, &upstream.uuid, cred, &refresher, &req)
            .await?;

        let selector = self.state.selector.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<CanonicalStreamEvent>(32);
        tokio::spawn(async move {
            let mut inner = inner;
            let mut codec_calls = Vec::new();
            let mut buffered_text = String::new();
            while let Some(event) = inner.next().await {
                match event {
                    CanonicalStreamEvent::TextDelta(ref delta) => {
                        buffered_text.push_str(delta);
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    CanonicalStreamEvent::ToolCall(ref call) => {
                        codec_calls.push(call.clone());
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    CanonicalStreamEvent::Error(ref message) => {
                        let _ = selector.report_error(id, message).await;
                        let _ = tx.send(event).await;
                        return;
                    }
                    CanonicalStreamEvent::Done { usage, stop_reason } => {
                        let _ = selector.report_success(id).await;
                        let reconciled = kiro_transform::toolcall::reconcile_tool_calls(&buffered_text, codec_calls.clone());
                        let mut saw_new_call = false;
                        for call in reconciled.into_iter().filter(|c| !codec_calls.contains(c)) {
                            saw_new_call = true;
                            if tx.send(CanonicalStreamEvent::ToolCall(call)).await.is_err() {
                                return;
                            }
                        }
                        let stop_reason = if saw_new_call { StopReason::ToolUse } else { stop_reason };
                        let _ = tx.send(CanonicalStreamEvent::Done { usage, stop_reason }).await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}

//! Wire protocol for the external OpenClaw gateway.
//!
//! The gateway speaks a JSON-RPC-like convention over WebSocket: `event`
//! frames carry dot-separated event names, `req`/`res` frames carry
//! request-id-correlated RPC calls. This module owns the frame model and the
//! mapping from wire event names into the closed [`GatewayEvent`] set.

use crate::{SpanKind, SpanStatus, TokenUsage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CHALLENGE_EVENT: &str = "connect.challenge";
pub const AUTH_EVENT: &str = "connect.auth";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireFrame {
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Res {
        id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<WireError>,
    },
}

impl WireFrame {
    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        WireFrame::Event {
            event: event.into(),
            payload,
        }
    }

    /// Challenge/response answer: echoes the nonce with an optional token.
    /// Structural handshake only; no credential is verified client-side.
    pub fn auth(nonce: impl Into<String>, token: Option<String>) -> Self {
        WireFrame::event(
            AUTH_EVENT,
            serde_json::json!({ "nonce": nonce.into(), "token": token }),
        )
    }

    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        WireFrame::Req {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengePayload {
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentThinkingPayload {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentToolCallPayload {
    pub agent_id: String,
    pub tool: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResponsePayload {
    pub agent_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanStartPayload {
    pub trace_id: String,
    pub span_id: String,
    pub kind: SpanKind,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanEndPayload {
    #[serde(default)]
    pub trace_id: Option<String>,
    pub span_id: String,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub status: Option<SpanStatus>,
    #[serde(default)]
    pub tokens: Option<TokenUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionUpdatePayload {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostUpdatePayload {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub amount_usd: f64,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequiredPayload {
    #[serde(default)]
    pub id: Option<String>,
    pub agent_id: String,
    pub tool: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayErrorPayload {
    #[serde(default)]
    pub agent_id: Option<String>,
    pub message: String,
}

/// Closed set of internal event kinds the reconciliation pipeline consumes.
///
/// Unmapped wire names land in [`GatewayEvent::Unknown`] rather than being
/// reclassified as a session update, so new upstream event types stay
/// observable.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    AgentThinking(AgentThinkingPayload),
    AgentToolCall(AgentToolCallPayload),
    AgentResponse(AgentResponsePayload),
    SpanStart(SpanStartPayload),
    SpanEnd(SpanEndPayload),
    SessionUpdate(SessionUpdatePayload),
    CostUpdate(CostUpdatePayload),
    ApprovalRequired(ApprovalRequiredPayload),
    Error(GatewayErrorPayload),
    Unknown { event: String, payload: Value },
}

impl GatewayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayEvent::AgentThinking(_) => "agent_thinking",
            GatewayEvent::AgentToolCall(_) => "agent_tool_call",
            GatewayEvent::AgentResponse(_) => "agent_response",
            GatewayEvent::SpanStart(_) => "span_start",
            GatewayEvent::SpanEnd(_) => "span_end",
            GatewayEvent::SessionUpdate(_) => "session_update",
            GatewayEvent::CostUpdate(_) => "cost_update",
            GatewayEvent::ApprovalRequired(_) => "approval_required",
            GatewayEvent::Error(_) => "error",
            GatewayEvent::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("malformed payload for '{event}': {message}")]
    MalformedPayload { event: String, message: String },
}

fn decode<T: DeserializeOwned>(event: &str, payload: Value) -> Result<T, MapError> {
    serde_json::from_value(payload).map_err(|err| MapError::MalformedPayload {
        event: event.to_string(),
        message: err.to_string(),
    })
}

/// Map a wire event name and payload into a [`GatewayEvent`].
pub fn map_event(event: &str, payload: Value) -> Result<GatewayEvent, MapError> {
    let mapped = match event {
        "agent.thinking" => GatewayEvent::AgentThinking(decode(event, payload)?),
        "agent.tool_call" => GatewayEvent::AgentToolCall(decode(event, payload)?),
        "agent.response" => GatewayEvent::AgentResponse(decode(event, payload)?),
        "span.start" => GatewayEvent::SpanStart(decode(event, payload)?),
        "span.end" => GatewayEvent::SpanEnd(decode(event, payload)?),
        "session.update" => GatewayEvent::SessionUpdate(decode(event, payload)?),
        "cost.update" => GatewayEvent::CostUpdate(decode(event, payload)?),
        "approval.required" => GatewayEvent::ApprovalRequired(decode(event, payload)?),
        "error" | "agent.error" => GatewayEvent::Error(decode(event, payload)?),
        other => GatewayEvent::Unknown {
            event: other.to_string(),
            payload,
        },
    };
    Ok(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_round_trips_event_req_res() {
        let frames = vec![
            WireFrame::event("agent.thinking", json!({"agent_id": "agent-1"})),
            WireFrame::request("req-1", "chat.send", json!({"content": "hi"})),
            WireFrame::Res {
                id: "req-1".to_string(),
                result: Some(json!({"ok": true})),
                error: None,
            },
            WireFrame::Res {
                id: "req-2".to_string(),
                result: None,
                error: Some(WireError {
                    code: "not_found".to_string(),
                    message: "no such session".to_string(),
                }),
            },
        ];
        for frame in frames {
            let encoded = serde_json::to_string(&frame).expect("encode");
            let decoded: WireFrame = serde_json::from_str(&encoded).expect("decode");
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn auth_frame_echoes_nonce() {
        let frame = WireFrame::auth("nonce-7", Some("tok".to_string()));
        match frame {
            WireFrame::Event { event, payload } => {
                assert_eq!(event, AUTH_EVENT);
                assert_eq!(payload["nonce"], "nonce-7");
                assert_eq!(payload["token"], "tok");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn known_names_map_to_typed_events() {
        let event = map_event(
            "span.start",
            json!({
                "trace_id": "trace-1",
                "span_id": "span-1",
                "kind": "tool_exec",
                "input": {"cmd": "ls"}
            }),
        )
        .expect("map span.start");
        match event {
            GatewayEvent::SpanStart(payload) => {
                assert_eq!(payload.trace_id, "trace-1");
                assert_eq!(payload.kind, SpanKind::ToolExec);
                assert!(payload.parent_span_id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let event = map_event("agent.response", json!({"agent_id": "a", "content": "Done"}))
            .expect("map agent.response");
        assert_eq!(event.kind(), "agent_response");
    }

    #[test]
    fn unknown_name_maps_to_unknown_not_session_update() {
        let event = map_event("foo.bar", json!({"anything": 1})).expect("map");
        match event {
            GatewayEvent::Unknown { event, payload } => {
                assert_eq!(event, "foo.bar");
                assert_eq!(payload["anything"], 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_a_typed_error() {
        let err = map_event("agent.response", json!({"agent_id": "a"}))
            .expect_err("content is required");
        assert!(matches!(err, MapError::MalformedPayload { ref event, .. } if event == "agent.response"));
    }

    #[test]
    fn span_end_defaults_keep_optional_fields_open() {
        let event = map_event("span.end", json!({"span_id": "span-9"})).expect("map span.end");
        match event {
            GatewayEvent::SpanEnd(payload) => {
                assert!(payload.trace_id.is_none());
                assert_eq!(payload.duration_ms, 0);
                assert!(payload.status.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

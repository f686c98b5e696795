//! Event processor: folds gateway events into store actions.
//!
//! [`reduce`] is a pure function over the current state and one inbound
//! event. It never mutates; it returns the [`StoreAction`]s to apply plus
//! any approval gates to raise on the side channel. Missing agent, trace,
//! or span ids drop the mutation; no retry, no requeue.

use crate::store::{OperatorState, StoreAction};
use chrono::Utc;
use opsboard_core::wire::{
    AgentResponsePayload, AgentThinkingPayload, AgentToolCallPayload, ApprovalRequiredPayload,
    CostUpdatePayload, GatewayErrorPayload, GatewayEvent, SessionUpdatePayload, SpanEndPayload,
    SpanStartPayload,
};
use opsboard_core::{
    AgentStatus, ApprovalRequest, ApprovalState, ChatMessage, ChatRole, Span, SpanStatus,
    ToolCall, Trace, TraceStatus,
};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct Reduction {
    pub actions: Vec<StoreAction>,
    pub approvals: Vec<ApprovalRequest>,
}

impl Reduction {
    fn with_actions(actions: Vec<StoreAction>) -> Self {
        Self {
            actions,
            approvals: Vec::new(),
        }
    }
}

pub fn reduce(state: &OperatorState, event: GatewayEvent) -> Reduction {
    match event {
        GatewayEvent::AgentThinking(payload) => on_agent_thinking(state, payload),
        GatewayEvent::AgentToolCall(payload) => on_agent_tool_call(payload),
        GatewayEvent::AgentResponse(payload) => on_agent_response(payload),
        GatewayEvent::SpanStart(payload) => on_span_start(state, payload),
        GatewayEvent::SpanEnd(payload) => on_span_end(state, payload),
        GatewayEvent::SessionUpdate(payload) => on_session_update(state, payload),
        GatewayEvent::CostUpdate(payload) => on_cost_update(payload),
        GatewayEvent::ApprovalRequired(payload) => on_approval_required(payload),
        GatewayEvent::Error(payload) => on_error(payload),
        GatewayEvent::Unknown { event, .. } => {
            warn!(event = "unknown_gateway_event", name = %event);
            Reduction::default()
        }
    }
}

fn on_agent_thinking(state: &OperatorState, payload: AgentThinkingPayload) -> Reduction {
    let label = state
        .agents
        .get(&payload.agent_id)
        .map(|agent| agent.name.clone())
        .unwrap_or_else(|| payload.agent_id.clone());
    Reduction::with_actions(vec![
        StoreAction::UpdateAgent {
            agent_id: payload.agent_id.clone(),
            status: AgentStatus::Active,
            current_task: Some("Thinking...".to_string()),
            completed_task: false,
        },
        StoreAction::SetAgentThinking(true),
        StoreAction::AddMessage(system_message(
            format!("{label} is thinking"),
            Some(payload.agent_id),
        )),
    ])
}

fn on_agent_tool_call(payload: AgentToolCallPayload) -> Reduction {
    let tool_call = ToolCall {
        id: Uuid::new_v4().to_string(),
        tool: payload.tool.clone(),
        params: payload.params,
        approval: ApprovalState::Pending,
    };
    Reduction::with_actions(vec![
        StoreAction::AddMessage(ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: ChatRole::Tool,
            content: format!("Tool call: {}", payload.tool),
            agent_id: Some(payload.agent_id.clone()),
            tool_calls: vec![tool_call],
            timestamp: Utc::now(),
        }),
        StoreAction::UpdateAgent {
            agent_id: payload.agent_id,
            status: AgentStatus::Active,
            current_task: Some(format!("Executing: {}", payload.tool)),
            completed_task: false,
        },
    ])
}

fn on_agent_response(payload: AgentResponsePayload) -> Reduction {
    Reduction::with_actions(vec![
        StoreAction::SetAgentThinking(false),
        StoreAction::AddMessage(ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: ChatRole::Agent,
            content: payload.content,
            agent_id: Some(payload.agent_id.clone()),
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
        }),
        StoreAction::UpdateAgent {
            agent_id: payload.agent_id,
            status: AgentStatus::Idle,
            current_task: None,
            completed_task: true,
        },
    ])
}

fn on_span_start(state: &OperatorState, payload: SpanStartPayload) -> Reduction {
    let span = Span {
        id: payload.span_id,
        kind: payload.kind,
        input: payload.input,
        output: None,
        duration_ms: 0,
        cost: 0.0,
        tokens: None,
        parent_span_id: payload.parent_span_id,
        status: SpanStatus::Running,
        started_at: Utc::now(),
    };
    let action = if state.trace(&payload.trace_id).is_some() {
        StoreAction::AddSpan {
            trace_id: payload.trace_id,
            span,
        }
    } else {
        StoreAction::AddTrace(Trace {
            id: payload.trace_id,
            agent_id: payload.agent_id,
            total_cost: span.cost,
            spans: vec![span],
            status: TraceStatus::Running,
            started_at: Utc::now(),
        })
    };
    Reduction::with_actions(vec![action])
}

fn on_span_end(state: &OperatorState, payload: SpanEndPayload) -> Reduction {
    let Some(trace_id) = payload
        .trace_id
        .or_else(|| state.active_trace_id.clone())
    else {
        warn!(event = "span_end_unresolved", span_id = %payload.span_id);
        return Reduction::default();
    };
    let known_span = state
        .trace(&trace_id)
        .is_some_and(|trace| trace.span(&payload.span_id).is_some());
    if !known_span {
        warn!(event = "span_end_unmatched", trace_id = %trace_id, span_id = %payload.span_id);
        return Reduction::default();
    }
    Reduction::with_actions(vec![StoreAction::UpdateSpan {
        trace_id,
        span_id: payload.span_id,
        output: payload.output,
        duration_ms: payload.duration_ms,
        cost: payload.cost,
        status: payload.status.unwrap_or(SpanStatus::Success),
        tokens: payload.tokens,
    }])
}

fn on_session_update(state: &OperatorState, payload: SessionUpdatePayload) -> Reduction {
    let Some(agent_id) = payload.agent_id else {
        return Reduction::default();
    };
    let Some(agent) = state.agents.get(&agent_id) else {
        warn!(event = "unknown_agent", agent_id = %agent_id);
        return Reduction::default();
    };
    let status = payload
        .status
        .as_deref()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(agent.status);
    let current_task = payload.current_task.or_else(|| agent.current_task.clone());
    Reduction::with_actions(vec![StoreAction::UpdateAgent {
        agent_id,
        status,
        current_task,
        completed_task: false,
    }])
}

fn on_cost_update(payload: CostUpdatePayload) -> Reduction {
    Reduction::with_actions(vec![StoreAction::AddSessionCost {
        agent_id: payload.agent_id,
        amount_usd: payload.amount_usd,
        model: payload.model,
    }])
}

fn on_approval_required(payload: ApprovalRequiredPayload) -> Reduction {
    let request = ApprovalRequest {
        id: payload
            .id
            .unwrap_or_else(|| format!("approval-{}", Utc::now().timestamp_millis())),
        agent_id: payload.agent_id.clone(),
        tool: payload.tool.clone(),
        params: payload.params,
        description: payload.description,
    };
    Reduction {
        actions: vec![StoreAction::AddMessage(system_message(
            format!("Approval required: {}", payload.tool),
            Some(payload.agent_id),
        ))],
        approvals: vec![request],
    }
}

fn on_error(payload: GatewayErrorPayload) -> Reduction {
    let mut actions = vec![StoreAction::AddMessage(system_message(
        format!("[error] {}", payload.message),
        payload.agent_id.clone(),
    ))];
    if let Some(agent_id) = payload.agent_id {
        actions.push(StoreAction::UpdateAgent {
            agent_id,
            status: AgentStatus::Error,
            current_task: None,
            completed_task: false,
        });
    }
    Reduction::with_actions(actions)
}

fn system_message(content: String, agent_id: Option<String>) -> ChatMessage {
    ChatMessage {
        id: Uuid::new_v4().to_string(),
        role: ChatRole::System,
        content,
        agent_id,
        tool_calls: Vec::new(),
        timestamp: Utc::now(),
    }
}

/// Convenience for consumers that hold both the state and the event stream.
pub fn apply_event(state: &mut OperatorState, event: GatewayEvent) -> Vec<ApprovalRequest> {
    let reduction = reduce(state, event);
    for action in reduction.actions {
        state.apply(action);
    }
    reduction.approvals
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsboard_core::wire::map_event;
    use opsboard_core::SpanKind;
    use serde_json::json;

    fn feed(state: &mut OperatorState, name: &str, payload: serde_json::Value) -> Vec<ApprovalRequest> {
        let event = map_event(name, payload).expect("map event");
        apply_event(state, event)
    }

    #[test]
    fn thinking_tool_call_response_scenario() {
        let mut state = OperatorState::seeded();

        feed(&mut state, "agent.thinking", json!({"agent_id": "agent-1"}));
        assert!(state.agent_thinking);
        assert_eq!(state.agents["agent-1"].status, AgentStatus::Active);
        assert_eq!(
            state.agents["agent-1"].current_task.as_deref(),
            Some("Thinking...")
        );

        feed(
            &mut state,
            "agent.tool_call",
            json!({"agent_id": "agent-1", "tool": "read", "params": {"path": "/tmp/a"}}),
        );
        assert_eq!(
            state.agents["agent-1"].current_task.as_deref(),
            Some("Executing: read")
        );

        feed(
            &mut state,
            "agent.response",
            json!({"agent_id": "agent-1", "content": "Done"}),
        );

        assert!(!state.agent_thinking);
        assert_eq!(state.agents["agent-1"].status, AgentStatus::Idle);
        assert!(state.agents["agent-1"].current_task.is_none());
        assert_eq!(state.agents["agent-1"].tasks_completed, 1);

        assert_eq!(state.messages.len(), 3);
        assert_eq!(state.messages[0].role, ChatRole::System);
        assert_eq!(state.messages[1].role, ChatRole::Tool);
        assert_eq!(state.messages[1].tool_calls.len(), 1);
        assert_eq!(state.messages[1].tool_calls[0].approval, ApprovalState::Pending);
        assert_eq!(state.messages[2].role, ChatRole::Agent);
        assert_eq!(state.messages[2].content, "Done");
    }

    #[test]
    fn response_resets_agent_regardless_of_prior_state() {
        let mut state = OperatorState::seeded();
        state.apply(StoreAction::SetAgentThinking(true));
        state.apply(StoreAction::UpdateAgent {
            agent_id: "agent-2".to_string(),
            status: AgentStatus::Error,
            current_task: Some("stuck".to_string()),
            completed_task: false,
        });

        feed(
            &mut state,
            "agent.response",
            json!({"agent_id": "agent-2", "content": "recovered"}),
        );

        assert!(!state.agent_thinking);
        assert_eq!(state.agents["agent-2"].status, AgentStatus::Idle);
        assert!(state.agents["agent-2"].current_task.is_none());
    }

    #[test]
    fn span_start_then_end_merges_fields_and_sums_cost() {
        let mut state = OperatorState::empty();
        feed(
            &mut state,
            "span.start",
            json!({
                "trace_id": "trace-1",
                "span_id": "span-1",
                "kind": "llm_call",
                "input": {"prompt": "hello"}
            }),
        );
        feed(
            &mut state,
            "span.start",
            json!({"trace_id": "trace-1", "span_id": "span-2", "kind": "shell"}),
        );

        let trace = state.trace("trace-1").expect("trace created");
        assert_eq!(trace.status, TraceStatus::Running);
        assert_eq!(trace.span("span-1").unwrap().status, SpanStatus::Running);
        assert_eq!(trace.span("span-2").unwrap().kind, SpanKind::Shell);

        feed(
            &mut state,
            "span.end",
            json!({
                "trace_id": "trace-1",
                "span_id": "span-1",
                "output": {"text": "hi"},
                "duration_ms": 900,
                "cost": 0.02,
                "status": "success",
                "tokens": {"input": 12, "output": 4}
            }),
        );
        feed(
            &mut state,
            "span.end",
            json!({"trace_id": "trace-1", "span_id": "span-2", "duration_ms": 40, "cost": 0.005}),
        );

        let trace = state.trace("trace-1").expect("trace exists");
        let span = trace.span("span-1").expect("span exists");
        assert_eq!(span.duration_ms, 900);
        assert_eq!(span.tokens, Some(opsboard_core::TokenUsage { input: 12, output: 4 }));
        assert!((trace.total_cost - 0.025).abs() < 1e-9);
        assert_eq!(trace.status, TraceStatus::Success);
    }

    #[test]
    fn span_end_without_matching_start_is_a_no_op() {
        let mut state = OperatorState::empty();
        feed(
            &mut state,
            "span.start",
            json!({"trace_id": "trace-1", "span_id": "span-1", "kind": "browser"}),
        );
        let before = format!("{state:?}");

        feed(
            &mut state,
            "span.end",
            json!({"trace_id": "trace-1", "span_id": "span-ghost", "cost": 9.0}),
        );
        feed(&mut state, "span.end", json!({"span_id": "span-ghost"}));

        assert_eq!(format!("{state:?}"), before);
    }

    #[test]
    fn span_end_without_trace_id_falls_back_to_active_trace() {
        let mut state = OperatorState::empty();
        feed(
            &mut state,
            "span.start",
            json!({"trace_id": "trace-1", "span_id": "span-1", "kind": "memory_search"}),
        );

        feed(
            &mut state,
            "span.end",
            json!({"span_id": "span-1", "duration_ms": 15, "cost": 0.001}),
        );

        let span = state.trace("trace-1").unwrap().span("span-1").unwrap();
        assert_eq!(span.duration_ms, 15);
        assert_eq!(span.status, SpanStatus::Success);
    }

    #[test]
    fn approval_required_raises_side_channel_with_defaulted_id() {
        let mut state = OperatorState::seeded();
        let approvals = feed(
            &mut state,
            "approval.required",
            json!({"agent_id": "agent-1", "tool": "shell", "params": {"cmd": "rm"}}),
        );

        assert_eq!(approvals.len(), 1);
        assert!(approvals[0].id.starts_with("approval-"));
        assert_eq!(approvals[0].tool, "shell");
        // Store only gets the system message; the request itself bypasses it.
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].role, ChatRole::System);
    }

    #[test]
    fn error_event_marks_agent_and_appends_marker_message() {
        let mut state = OperatorState::seeded();
        feed(
            &mut state,
            "agent.error",
            json!({"agent_id": "agent-3", "message": "tool crashed"}),
        );

        assert_eq!(state.agents["agent-3"].status, AgentStatus::Error);
        assert!(state.agents["agent-3"].current_task.is_none());
        assert!(state.messages[0].content.starts_with("[error]"));
    }

    #[test]
    fn unknown_event_mutates_nothing() {
        let mut state = OperatorState::seeded();
        let before = format!("{state:?}");
        feed(&mut state, "foo.bar", json!({"x": 1}));
        assert_eq!(format!("{state:?}"), before);
    }

    #[test]
    fn session_update_folds_status_and_task() {
        let mut state = OperatorState::seeded();
        feed(
            &mut state,
            "session.update",
            json!({"agent_id": "agent-1", "status": "paused", "current_task": "waiting on review"}),
        );
        assert_eq!(state.agents["agent-1"].status, AgentStatus::Paused);
        assert_eq!(
            state.agents["agent-1"].current_task.as_deref(),
            Some("waiting on review")
        );

        // Unparseable status keeps the previous one.
        feed(
            &mut state,
            "session.update",
            json!({"agent_id": "agent-1", "status": "warp-speed"}),
        );
        assert_eq!(state.agents["agent-1"].status, AgentStatus::Paused);
    }

    #[test]
    fn cost_update_accumulates_session_cost() {
        let mut state = OperatorState::empty();
        feed(&mut state, "cost.update", json!({"amount_usd": 0.10}));
        feed(&mut state, "cost.update", json!({"amount_usd": 0.05}));
        assert!((state.session_cost - 0.15).abs() < 1e-9);
    }

    #[test]
    fn cost_update_attributes_amount_and_model_to_the_agent() {
        let mut state = OperatorState::seeded();
        feed(
            &mut state,
            "cost.update",
            json!({"agent_id": "agent-1", "amount_usd": 0.25, "model": "opus-4"}),
        );
        feed(&mut state, "cost.update", json!({"agent_id": "agent-1", "amount_usd": 0.10}));
        // Unattributed costs only touch the session total.
        feed(&mut state, "cost.update", json!({"amount_usd": 0.40}));

        assert!((state.session_cost - 0.75).abs() < 1e-9);
        assert!((state.agents["agent-1"].session_cost - 0.35).abs() < 1e-9);
        assert_eq!(state.agents["agent-1"].model, "opus-4");
        assert_eq!(state.agents["agent-2"].session_cost, 0.0);
    }
}

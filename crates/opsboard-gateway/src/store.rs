//! Operator state store: the single mutable container behind the console.
//!
//! All mutation goes through [`OperatorState::apply`] with a tagged
//! [`StoreAction`], so the event processor can be exercised against a plain
//! value without any live transport. Last writer wins; there is no
//! versioning.

use chrono::Utc;
use opsboard_core::{Agent, AgentStatus, ChatMessage, Span, SpanStatus, Trace, TraceStatus};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum StoreAction {
    UpdateAgent {
        agent_id: String,
        status: AgentStatus,
        current_task: Option<String>,
        completed_task: bool,
    },
    SetAgentThinking(bool),
    AddMessage(ChatMessage),
    AddTrace(Trace),
    AddSpan {
        trace_id: String,
        span: Span,
    },
    UpdateSpan {
        trace_id: String,
        span_id: String,
        output: Option<Value>,
        duration_ms: u64,
        cost: f64,
        status: SpanStatus,
        tokens: Option<opsboard_core::TokenUsage>,
    },
    AddSessionCost {
        agent_id: Option<String>,
        amount_usd: f64,
        model: Option<String>,
    },
    SelectAgent(Option<String>),
    Reset,
}

#[derive(Debug, Clone, Default)]
pub struct OperatorState {
    pub agents: BTreeMap<String, Agent>,
    pub traces: Vec<Trace>,
    pub messages: Vec<ChatMessage>,
    pub agent_thinking: bool,
    pub session_cost: f64,
    pub selected_agent: Option<String>,
    /// Fallback trace id for span_end events that omit one.
    pub active_trace_id: Option<String>,
}

impl OperatorState {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Static demo seed used by mock mode and by `Reset`.
    pub fn seeded() -> Self {
        let now = Utc::now();
        let agent = |id: &str, name: &str, role: &str, model: &str| Agent {
            id: id.to_string(),
            name: name.to_string(),
            role: role.to_string(),
            model: model.to_string(),
            status: AgentStatus::Idle,
            current_task: None,
            last_active: now,
            tasks_completed: 0,
            session_cost: 0.0,
        };
        let mut state = Self::default();
        for seed in [
            agent("agent-1", "Scout", "researcher", "sonnet-4"),
            agent("agent-2", "Builder", "implementer", "opus-4"),
            agent("agent-3", "Auditor", "reviewer", "haiku-3"),
        ] {
            state.agents.insert(seed.id.clone(), seed);
        }
        state
    }

    pub fn trace(&self, trace_id: &str) -> Option<&Trace> {
        self.traces.iter().find(|trace| trace.id == trace_id)
    }

    pub fn trace_mut(&mut self, trace_id: &str) -> Option<&mut Trace> {
        self.traces.iter_mut().find(|trace| trace.id == trace_id)
    }

    pub fn apply(&mut self, action: StoreAction) {
        match action {
            StoreAction::UpdateAgent {
                agent_id,
                status,
                current_task,
                completed_task,
            } => {
                let Some(agent) = self.agents.get_mut(&agent_id) else {
                    warn!(event = "unknown_agent", agent_id = %agent_id);
                    return;
                };
                agent.status = status;
                agent.current_task = current_task;
                agent.last_active = Utc::now();
                if completed_task {
                    agent.tasks_completed += 1;
                }
            }
            StoreAction::SetAgentThinking(thinking) => {
                self.agent_thinking = thinking;
            }
            StoreAction::AddMessage(message) => {
                self.messages.push(message);
            }
            StoreAction::AddTrace(trace) => {
                self.active_trace_id = Some(trace.id.clone());
                self.traces.push(trace);
            }
            StoreAction::AddSpan { trace_id, span } => {
                let Some(trace) = self.trace_mut(&trace_id) else {
                    warn!(event = "unknown_trace", trace_id = %trace_id);
                    return;
                };
                trace.spans.push(span);
                trace.recompute_total_cost();
                self.active_trace_id = Some(trace_id);
            }
            StoreAction::UpdateSpan {
                trace_id,
                span_id,
                output,
                duration_ms,
                cost,
                status,
                tokens,
            } => {
                let Some(trace) = self.trace_mut(&trace_id) else {
                    warn!(event = "unknown_trace", trace_id = %trace_id);
                    return;
                };
                let Some(span) = trace.span_mut(&span_id) else {
                    warn!(event = "unknown_span", trace_id = %trace_id, span_id = %span_id);
                    return;
                };
                span.output = output;
                span.duration_ms = duration_ms;
                span.cost = cost;
                span.status = status;
                span.tokens = tokens;
                trace.recompute_total_cost();
                settle_trace_status(trace);
            }
            StoreAction::AddSessionCost {
                agent_id,
                amount_usd,
                model,
            } => {
                self.session_cost += amount_usd;
                if let Some(agent) = agent_id.and_then(|id| self.agents.get_mut(&id)) {
                    agent.session_cost += amount_usd;
                    agent.last_active = Utc::now();
                    if let Some(model) = model {
                        agent.model = model;
                    }
                }
            }
            StoreAction::SelectAgent(agent_id) => {
                self.selected_agent = agent_id;
            }
            StoreAction::Reset => {
                *self = Self::seeded();
            }
        }
    }
}

/// A trace settles to `error` as soon as any span errors, and to `success`
/// once no span is still open.
fn settle_trace_status(trace: &mut Trace) {
    if trace.spans.iter().any(|span| span.status == SpanStatus::Error) {
        trace.status = TraceStatus::Error;
    } else if trace
        .spans
        .iter()
        .all(|span| span.status.is_terminal())
    {
        trace.status = TraceStatus::Success;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsboard_core::SpanKind;
    use serde_json::json;

    fn running_span(id: &str, cost: f64) -> Span {
        Span {
            id: id.to_string(),
            kind: SpanKind::LlmCall,
            input: json!({"prompt": "p"}),
            output: None,
            duration_ms: 0,
            cost,
            tokens: None,
            parent_span_id: None,
            status: SpanStatus::Running,
            started_at: Utc::now(),
        }
    }

    fn running_trace(id: &str) -> Trace {
        Trace {
            id: id.to_string(),
            agent_id: None,
            spans: Vec::new(),
            total_cost: 0.0,
            status: TraceStatus::Running,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn update_for_unknown_agent_is_skipped() {
        let mut state = OperatorState::seeded();
        let before = state.agents.clone();
        state.apply(StoreAction::UpdateAgent {
            agent_id: "agent-99".to_string(),
            status: AgentStatus::Active,
            current_task: Some("x".to_string()),
            completed_task: true,
        });
        assert_eq!(state.agents.len(), before.len());
        assert!(!state.agents.contains_key("agent-99"));
    }

    #[test]
    fn add_span_tracks_active_trace_and_total_cost() {
        let mut state = OperatorState::empty();
        state.apply(StoreAction::AddTrace(running_trace("trace-1")));
        state.apply(StoreAction::AddSpan {
            trace_id: "trace-1".to_string(),
            span: running_span("span-1", 0.10),
        });
        state.apply(StoreAction::AddSpan {
            trace_id: "trace-1".to_string(),
            span: running_span("span-2", 0.15),
        });

        assert_eq!(state.active_trace_id.as_deref(), Some("trace-1"));
        let trace = state.trace("trace-1").expect("trace exists");
        assert_eq!(trace.spans.len(), 2);
        assert!((trace.total_cost - 0.25).abs() < 1e-9);
    }

    #[test]
    fn update_span_merges_fields_and_settles_trace() {
        let mut state = OperatorState::empty();
        let mut trace = running_trace("trace-1");
        trace.spans.push(running_span("span-1", 0.0));
        state.apply(StoreAction::AddTrace(trace));

        state.apply(StoreAction::UpdateSpan {
            trace_id: "trace-1".to_string(),
            span_id: "span-1".to_string(),
            output: Some(json!({"text": "done"})),
            duration_ms: 420,
            cost: 0.03,
            status: SpanStatus::Success,
            tokens: Some(opsboard_core::TokenUsage { input: 100, output: 20 }),
        });

        let trace = state.trace("trace-1").expect("trace exists");
        assert_eq!(trace.status, TraceStatus::Success);
        let span = trace.span("span-1").expect("span exists");
        assert_eq!(span.duration_ms, 420);
        assert_eq!(span.status, SpanStatus::Success);
        assert!((trace.total_cost - 0.03).abs() < 1e-9);
    }

    #[test]
    fn update_span_for_unknown_span_leaves_state_unchanged() {
        let mut state = OperatorState::empty();
        let mut trace = running_trace("trace-1");
        trace.spans.push(running_span("span-1", 0.5));
        state.apply(StoreAction::AddTrace(trace));
        let before = format!("{state:?}");

        state.apply(StoreAction::UpdateSpan {
            trace_id: "trace-1".to_string(),
            span_id: "span-never-started".to_string(),
            output: None,
            duration_ms: 1,
            cost: 1.0,
            status: SpanStatus::Error,
            tokens: None,
        });

        assert_eq!(format!("{state:?}"), before);
    }

    #[test]
    fn errored_span_settles_trace_to_error() {
        let mut state = OperatorState::empty();
        let mut trace = running_trace("trace-1");
        trace.spans.push(running_span("span-1", 0.0));
        trace.spans.push(running_span("span-2", 0.0));
        state.apply(StoreAction::AddTrace(trace));

        state.apply(StoreAction::UpdateSpan {
            trace_id: "trace-1".to_string(),
            span_id: "span-1".to_string(),
            output: None,
            duration_ms: 5,
            cost: 0.0,
            status: SpanStatus::Error,
            tokens: None,
        });

        assert_eq!(state.trace("trace-1").unwrap().status, TraceStatus::Error);
    }

    #[test]
    fn reset_restores_the_demo_seed() {
        let mut state = OperatorState::seeded();
        state.apply(StoreAction::SetAgentThinking(true));
        state.apply(StoreAction::AddTrace(running_trace("trace-1")));
        state.apply(StoreAction::AddSessionCost {
            agent_id: None,
            amount_usd: 1.25,
            model: None,
        });

        state.apply(StoreAction::Reset);

        assert!(!state.agent_thinking);
        assert!(state.traces.is_empty());
        assert_eq!(state.session_cost, 0.0);
        assert_eq!(state.agents.len(), 3);
    }
}

//! Typed pub/sub channel for approval gates.
//!
//! Approval requests bypass the operator store: the processor raises them
//! here and UI layers (the console modal) subscribe. Replaces the original
//! DOM-custom-event routing with something testable off-screen.

use opsboard_core::ApprovalRequest;
use tokio::sync::broadcast;
use tracing::debug;

const APPROVAL_CHANNEL_CAPACITY: usize = 32;

#[derive(Clone)]
pub struct ApprovalBus {
    tx: broadcast::Sender<ApprovalRequest>,
}

impl ApprovalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(APPROVAL_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish a request to every live subscriber. With no subscribers the
    /// request is dropped, matching the fire-and-forget original.
    pub fn publish(&self, request: ApprovalRequest) {
        let delivered = self.tx.send(request).unwrap_or(0);
        debug!(event = "approval_published", subscribers = delivered);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.tx.subscribe()
    }
}

impl Default for ApprovalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: &str) -> ApprovalRequest {
        ApprovalRequest {
            id: id.to_string(),
            agent_id: "agent-1".to_string(),
            tool: "shell".to_string(),
            params: json!({"cmd": "ls"}),
            description: None,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_requests() {
        let bus = ApprovalBus::new();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.publish(request("approval-1"));

        assert_eq!(rx_a.recv().await.unwrap().id, "approval-1");
        assert_eq!(rx_b.recv().await.unwrap().id, "approval-1");
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = ApprovalBus::new();
        bus.publish(request("approval-2"));
    }
}

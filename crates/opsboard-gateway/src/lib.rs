//! Gateway event ingestion and reconciliation pipeline.
//!
//! [`transport`] owns the single WebSocket connection to the external
//! OpenClaw gateway (challenge/response handshake, capped reconnect backoff,
//! mock mode, request-id-correlated RPC). Inbound frames are mapped into
//! [`opsboard_core::wire::GatewayEvent`]s and folded into the operator state
//! by the pure reducer in [`processor`]; [`store`] holds the state and the
//! action set; [`approvals`] carries approval gates out-of-band.

pub mod approvals;
pub mod backoff;
pub mod processor;
pub mod store;
pub mod transport;

pub use approvals::ApprovalBus;
pub use backoff::ReconnectBackoff;
pub use processor::{reduce, Reduction};
pub use store::{OperatorState, StoreAction};
pub use transport::{GatewayConfig, GatewayHandle, GatewayNotice, LinkState};

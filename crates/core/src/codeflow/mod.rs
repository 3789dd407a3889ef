//! Flowing code between the VMR and its component repositories.

pub mod backflow;
pub mod engine;
pub mod forward;
pub mod last_flows;
pub mod orchestrator;
pub mod strategy;

pub use backflow::BackflowStrategy;
pub use engine::{CodeflowEngine, CodeflowResult, FlowRequest};
pub use forward::ForwardStrategy;
pub use last_flows::LastFlowResolver;
pub use orchestrator::{flow_code, FlowOutcome};
pub use strategy::{FlowContext, FlowStrategy};

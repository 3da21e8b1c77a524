//! Tower middleware layers for the invocation pipeline.
//!
//! - [`metrics`]: invocation timing and outcome via `tracing` spans
//! - [`pipeline`]: composes the layers around a [`GatewayService`](crate::invocation::GatewayService)

pub mod metrics;
pub mod pipeline;

pub use metrics::MetricsLayer;
pub use pipeline::build_gateway_pipeline;

//! Pipeline composition: wraps the gateway service in its middleware stack.

use std::sync::Arc;

use capgate_core::Value;
use tower::ServiceBuilder;

use super::metrics::MetricsLayer;
use crate::error::GatewayError;
use crate::invocation::{GatewayService, Invocation};
use crate::router::Gateway;

/// Builds the invocation pipeline around a shared gateway.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- span with timing and outcome
/// 2. `GatewayService` -- budget, fast path, cache, module execution
#[must_use]
pub fn build_gateway_pipeline(
    gateway: Arc<Gateway>,
) -> impl tower::Service<Invocation, Response = Value, Error = GatewayError> + Clone {
    ServiceBuilder::new()
        .layer(MetricsLayer)
        .service(GatewayService::new(gateway))
}

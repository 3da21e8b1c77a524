//! Per-invocation timing and outcome via `tracing` spans.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use capgate_core::Value;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::error::GatewayError;
use crate::invocation::Invocation;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps each invocation in an `invocation` span.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records duration and outcome (`ok` or the error kind) of every invocation.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Invocation> for MetricsService<S>
where
    S: Service<Invocation, Response = Value, Error = GatewayError> + Send,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = GatewayError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, GatewayError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let key = invocation.key.to_string();
        let call_id = invocation.call_id;

        let span = info_span!(
            "invocation",
            key = %key,
            call_id = call_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = {
            let _entered = span.enter();
            self.inner.call(invocation)
        };

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(err) => err.kind(),
                };
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                tracing::info!(
                    key = %key,
                    call_id = call_id,
                    duration_ms = duration_ms,
                    outcome = outcome,
                    "invocation complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

//! Tower adapter: exposes [`Gateway::execute`] as a `tower::Service`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use capgate_core::{Arguments, OperationKey, Value};
use tower::Service;

use crate::error::GatewayError;
use crate::router::Gateway;

/// One request travelling through the service stack.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub key: OperationKey,
    pub args: Arguments,
    /// Caller-chosen correlation id, carried into tracing spans.
    pub call_id: u64,
}

impl Invocation {
    #[must_use]
    pub fn new(key: OperationKey, args: Arguments) -> Self {
        Self {
            key,
            args,
            call_id: 0,
        }
    }

    #[must_use]
    pub fn with_call_id(mut self, call_id: u64) -> Self {
        self.call_id = call_id;
        self
    }
}

/// Innermost service: hands each invocation to a shared [`Gateway`].
#[derive(Clone)]
pub struct GatewayService {
    gateway: Arc<Gateway>,
}

impl GatewayService {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

impl Service<Invocation> for GatewayService {
    type Response = Value;
    type Error = GatewayError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, GatewayError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let gateway = self.gateway.clone();
        Box::pin(async move { gateway.execute(&invocation.key, &invocation.args) })
    }
}

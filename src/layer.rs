//! Tower adapter: wrap any `Service` in a [`ResilienceDecorator`].
//!
//! Requests must be `Clone` because a retry re-issues them against a fresh clone of the inner
//! service. Errors of the inner service come back as [`ResilienceError::Inner`].

use crate::decorator::ResilienceDecorator;
use crate::error::ResilienceError;
use futures::future::{poll_fn, BoxFuture};
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

pub struct ResilienceLayer<E> {
    decorator: Arc<ResilienceDecorator<E>>,
}

impl<E> ResilienceLayer<E> {
    pub fn new(decorator: ResilienceDecorator<E>) -> Self {
        Self { decorator: Arc::new(decorator) }
    }

    /// Reuse a decorator that other call sites also hold.
    pub fn from_shared(decorator: Arc<ResilienceDecorator<E>>) -> Self {
        Self { decorator }
    }
}

impl<E> Clone for ResilienceLayer<E> {
    fn clone(&self) -> Self {
        Self { decorator: self.decorator.clone() }
    }
}

impl<E> fmt::Debug for ResilienceLayer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceLayer").field("decorator", &self.decorator).finish()
    }
}

impl<S, E> Layer<S> for ResilienceLayer<E> {
    type Service = ResilienceService<S, E>;

    fn layer(&self, inner: S) -> Self::Service {
        ResilienceService { inner, decorator: self.decorator.clone() }
    }
}

pub struct ResilienceService<S, E> {
    inner: S,
    decorator: Arc<ResilienceDecorator<E>>,
}

impl<S: Clone, E> Clone for ResilienceService<S, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), decorator: self.decorator.clone() }
    }
}

impl<S: fmt::Debug, E> fmt::Debug for ResilienceService<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceService")
            .field("inner", &self.inner)
            .field("decorator", &self.decorator)
            .finish()
    }
}

impl<S, E, Req> Service<Req> for ResilienceService<S, E>
where
    S: Service<Req, Error = E> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    Req: Clone + Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<E>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let decorator = self.decorator.clone();
        let inner = self.inner.clone();

        Box::pin(async move {
            decorator
                .execute(move || {
                    let mut service = inner.clone();
                    let req = req.clone();
                    async move {
                        if let Err(err) = poll_fn(|cx| service.poll_ready(cx)).await {
                            return Err(ResilienceError::Inner(err));
                        }
                        service.call(req).await.map_err(ResilienceError::Inner)
                    }
                })
                .await
        })
    }
}

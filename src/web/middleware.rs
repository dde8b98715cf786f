//! Request middleware
//!
//! Bearer-token guard for the dashboard API and client address resolution
//! for reporting nodes behind a reverse proxy.

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, HeaderMap, Method, Request},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::debug;

use super::auth::{bearer_token, JwtKeys};
use crate::error::TrafficError;

/// Get the real client IP address, checking proxy headers first
/// Priority: X-Real-IP > X-Forwarded-For (first IP) > peer address
pub fn get_real_ip(headers: &HeaderMap, fallback_ip: &str) -> String {
    // Set by Caddy/nginx
    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip) = real_ip.to_str() {
            let ip = ip.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    // May contain a chain of proxies, first is the client
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(ips) = forwarded.to_str() {
            if let Some(first_ip) = ips.split(',').next() {
                let ip = first_ip.trim();
                if !ip.is_empty() {
                    return ip.to_string();
                }
            }
        }
    }

    fallback_ip.to_string()
}

/// Layer requiring a valid bearer token
#[derive(Clone)]
pub struct AuthLayer {
    keys: Arc<JwtKeys>,
}

impl AuthLayer {
    pub fn new(keys: Arc<JwtKeys>) -> Self {
        Self { keys }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            keys: self.keys.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    keys: Arc<JwtKeys>,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let keys = self.keys.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // CORS preflight carries no credentials
            if request.method() == Method::OPTIONS {
                return inner.call(request).await;
            }

            let token = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(bearer_token);

            let Some(token) = token else {
                debug!("Rejected {} {}: missing token", request.method(), request.uri().path());
                let error = TrafficError::Unauthorized("missing bearer token".to_string());
                return Ok(error.into_response());
            };

            if let Err(e) = keys.verify(token) {
                debug!("Rejected {} {}: {}", request.method(), request.uri().path(), e);
                return Ok(e.into_response());
            }

            inner.call(request).await
        })
    }
}

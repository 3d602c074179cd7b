
use crate::limiter::{Decision, RateLimiter};
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::HttpResponse;
use futures::future::{ok, LocalBoxFuture, Ready};
use serde::Serialize;
use std::rc::Rc;
use std::sync::Arc;

pub const DENIED_MESSAGE: &str = "Too many requests, please try again later.";

/// JSON body of a 429 response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeniedBody {
    pub message: &'static str,
    pub limit: u64,
    pub remaining: u64,
    /// Milliseconds since the Unix epoch.
    pub reset_at: u64,
    /// Seconds.
    pub retry_after: u64,
}

/// Rate limit middleware.
///
/// Every request is checked against its endpoint's quota before it reaches the wrapped service.
/// Allowed requests get the `x-ratelimit-*` headers added to their response. Denied requests
/// are answered with `429 Too Many Requests`, a [DeniedBody] and a `retry-after` header.
#[derive(Clone)]
pub struct RateLimit {
    limiter: Arc<RateLimiter>,
}

impl RateLimit {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimitMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimitMiddleware {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
        })
    }
}

pub struct RateLimitMiddleware<S> {
    service: Rc<S>,
    limiter: Arc<RateLimiter>,
}

fn denied_response(limiter: &RateLimiter, decision: &Decision) -> HttpResponse {
    HttpResponse::TooManyRequests().json(DeniedBody {
        message: DENIED_MESSAGE,
        limit: decision.limit,
        remaining: decision.remaining,
        reset_at: decision.reset_at,
        retry_after: limiter.retry_after(decision),
    })
}

fn attach(target: &mut HeaderMap, headers: HeaderMap) {
    for (name, value) in headers {
        target.insert(name, value);
    }
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let limiter = self.limiter.clone();

        Box::pin(async move {
            let endpoint = req.path().to_owned();
            let method = req.method().as_str().to_owned();
            let decision = limiter.check(req.request(), &endpoint, &method).await;
            let headers = limiter.headers_for(&decision);

            if decision.is_denied() {
                let mut response = denied_response(&limiter, &decision);
                attach(response.headers_mut(), headers);
                return Ok(req.into_response(response).map_into_right_body());
            }

            // The count is final from here on, whatever the service returns
            let mut service_response = service.call(req).await?;
            attach(service_response.headers_mut(), headers);
            Ok(service_response.map_into_left_body())
        })
    }
}

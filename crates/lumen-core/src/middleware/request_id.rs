//! Request ID middleware
//!
//! Reuses an incoming `X-Request-ID` or generates a UUID, exposes it to
//! handlers through the context store and echoes it on the response.

use super::{from_fn, Middleware};
use crate::Context;

/// Header carrying the request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Context store key holding the request id
pub const REQUEST_ID_KEY: &str = "request_id";

pub fn request_id() -> Middleware {
    from_fn(|ctx: Context, next| async move {
        let id = ctx
            .header(REQUEST_ID_HEADER)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        ctx.set(REQUEST_ID_KEY, id.clone());
        if let Err(e) = ctx.set_header(REQUEST_ID_HEADER, &id) {
            tracing::debug!(error = %e, "Request id not echoed");
        }

        next(ctx).await;
    })
}

//! Request deadline enforcement

use super::{BoxFuture, Handler, Middleware};
use crate::Context;
use http::StatusCode;
use std::sync::Arc;

/// Stop waiting on the chain once the request scope ends
///
/// On expiry the scope is cancelled so cooperative handlers can stop, and a
/// 503 is sent unless the handler already produced a response. Requests
/// whose scope has no deadline run unbounded.
pub fn deadline() -> Middleware {
    Arc::new(|next: Handler| {
        Arc::new(move |ctx: Context| -> BoxFuture {
            let next = next.clone();
            Box::pin(async move {
                if ctx.deadline().is_none() {
                    next(ctx).await;
                    return;
                }

                tokio::select! {
                    _ = next(ctx.clone()) => {}
                    _ = ctx.done() => {
                        ctx.cancel();
                        tracing::warn!(
                            method = %ctx.method(),
                            path = %ctx.path(),
                            "Request deadline exceeded"
                        );
                        if !ctx.is_written() {
                            ctx.text(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
                        }
                    }
                }
            })
        }) as Handler
    })
}

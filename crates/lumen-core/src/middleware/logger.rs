//! Access logging middleware

use super::{BoxFuture, Handler, Middleware};
use crate::Context;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Log a start and a completion event per request
///
/// Completion severity follows the status: error for 5xx, warn for 4xx,
/// info otherwise.
pub fn logger() -> Middleware {
    Arc::new(|next: Handler| {
        Arc::new(move |ctx: Context| -> BoxFuture {
            let next = next.clone();
            let span = tracing::info_span!("request", method = %ctx.method(), path = %ctx.path());

            Box::pin(
                async move {
                    let start = Instant::now();
                    tracing::info!(remote = ?ctx.remote_addr(), "Request started");

                    next(ctx.clone()).await;

                    let status = ctx.get_status().as_u16();
                    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
                    if status >= 500 {
                        tracing::error!(status, duration_ms, "Request completed");
                    } else if status >= 400 {
                        tracing::warn!(status, duration_ms, "Request completed");
                    } else {
                        tracing::info!(status, duration_ms, "Request completed");
                    }
                }
                .instrument(span),
            )
        }) as Handler
    })
}

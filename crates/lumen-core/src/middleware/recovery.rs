//! Panic recovery middleware
//!
//! Catches panics escaping the wrapped handler, logs them with the request
//! method and path, and replaces whatever was buffered with a 500.

use super::{BoxFuture, Handler, Middleware};
use crate::Context;
use futures_util::FutureExt;
use http::StatusCode;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub fn recovery() -> Middleware {
    Arc::new(|next: Handler| {
        Arc::new(move |ctx: Context| -> BoxFuture {
            let next = next.clone();
            Box::pin(async move {
                let result = AssertUnwindSafe(next(ctx.clone())).catch_unwind().await;

                if let Err(payload) = result {
                    tracing::error!(
                        method = %ctx.method(),
                        path = %ctx.path(),
                        panic = %panic_message(payload.as_ref()),
                        "Panic recovered"
                    );
                    ctx.reset_response();
                    ctx.text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
                }
            })
        }) as Handler
    })
}

//! In-memory todo API
//!
//! ```text
//! GET    /api/v1/todos
//! POST   /api/v1/todos        {"title": "..."}
//! GET    /api/v1/todos/:id
//! PUT    /api/v1/todos/:id    {"title": "...", "completed": true}
//! DELETE /api/v1/todos/:id
//! ```

use http::StatusCode;
use lumen_core::middleware::{cors, request_id, CorsConfig};
use lumen_core::{handler, App, AppConfig, Context, Handler};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone, Serialize)]
struct Todo {
    id: String,
    title: String,
    completed: bool,
}

#[derive(Deserialize)]
struct CreateTodo {
    title: String,
}

#[derive(Deserialize)]
struct UpdateTodo {
    title: Option<String>,
    completed: Option<bool>,
}

#[derive(Default)]
struct Store {
    todos: RwLock<HashMap<String, Todo>>,
    order: RwLock<Vec<String>>,
}

type Shared = Arc<Store>;

fn with_store<F, Fut>(store: &Shared, f: F) -> Handler
where
    F: Fn(Context, Shared) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let store = store.clone();
    handler(move |ctx: Context| f(ctx, store.clone()))
}

fn reply_json<T: Serialize>(ctx: &Context, status: StatusCode, value: &T) {
    if let Err(e) = ctx.json(status, value) {
        tracing::error!(error = %e, "Failed to encode response");
        ctx.text(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed");
    }
}

fn not_found(ctx: &Context) {
    reply_json(ctx, StatusCode::NOT_FOUND, &serde_json::json!({ "error": "todo not found" }));
}

async fn list(ctx: Context, store: Shared) {
    let todos = store.todos.read();
    let items: Vec<&Todo> = store
        .order
        .read()
        .iter()
        .filter_map(|id| todos.get(id))
        .collect();
    reply_json(&ctx, StatusCode::OK, &items);
}

async fn create(ctx: Context, store: Shared) {
    let input: CreateTodo = match ctx.bind() {
        Ok(input) => input,
        Err(e) => {
            let body = serde_json::json!({ "error": e.to_string() });
            reply_json(&ctx, StatusCode::BAD_REQUEST, &body);
            return;
        }
    };

    let todo = Todo {
        id: uuid::Uuid::new_v4().simple().to_string(),
        title: input.title,
        completed: false,
    };
    store.todos.write().insert(todo.id.clone(), todo.clone());
    store.order.write().push(todo.id.clone());

    tracing::info!(id = %todo.id, "Todo created");
    reply_json(&ctx, StatusCode::CREATED, &todo);
}

async fn get(ctx: Context, store: Shared) {
    let id = ctx.param("id").unwrap_or_default();
    let todo = store.todos.read().get(&id).cloned();
    match todo {
        Some(todo) => reply_json(&ctx, StatusCode::OK, &todo),
        None => not_found(&ctx),
    }
}

async fn update(ctx: Context, store: Shared) {
    let id = ctx.param("id").unwrap_or_default();
    let input: UpdateTodo = match ctx.bind() {
        Ok(input) => input,
        Err(e) => {
            let body = serde_json::json!({ "error": e.to_string() });
            reply_json(&ctx, StatusCode::BAD_REQUEST, &body);
            return;
        }
    };

    let updated = {
        let mut todos = store.todos.write();
        todos.get_mut(&id).map(|todo| {
            if let Some(title) = input.title {
                todo.title = title;
            }
            if let Some(completed) = input.completed {
                todo.completed = completed;
            }
            todo.clone()
        })
    };

    match updated {
        Some(todo) => reply_json(&ctx, StatusCode::OK, &todo),
        None => not_found(&ctx),
    }
}

async fn delete(ctx: Context, store: Shared) {
    let id = ctx.param("id").unwrap_or_default();
    if store.todos.write().remove(&id).is_none() {
        not_found(&ctx);
        return;
    }
    store.order.write().retain(|existing| existing != &id);
    ctx.status(StatusCode::NO_CONTENT);
}

fn routes(app: &App, store: &Shared) -> lumen_core::Result<()> {
    let todos = app.group("/api/v1/todos", &[]);
    todos.get("/", with_store(store, list), &[])?;
    todos.post("/", with_store(store, create), &[])?;
    todos.get("/:id", with_store(store, get), &[])?;
    todos.put("/:id", with_store(store, update), &[])?;
    todos.delete("/:id", with_store(store, delete), &[])?;

    app.get("/health", handler(|ctx: Context| async move {
        ctx.text(StatusCode::OK, "ok");
    }), &[])?;
    Ok(())
}

#[tokio::main]
async fn main() -> lumen_core::Result<()> {
    lumen_core::logging::init("todo=info,lumen_core=info");

    let addr: SocketAddr = std::env::var("TODO_ADDR")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));

    let app = App::with_config(AppConfig::new().addr(addr))?;
    app.use_middleware(request_id());
    app.use_middleware(cors(CorsConfig::new()));

    let store = Shared::default();
    routes(&app, &store)?;

    for (method, pattern) in app.routes() {
        tracing::debug!(%method, %pattern, "Route");
    }

    app.listen(lumen_core::shutdown_signal()).await
}

use serde_json::Value;
use tracing::debug;

use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type TryHandle = fn(&mut AppState, &Request) -> Option<Value>;

const HANDLERS: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::session::try_handle,
    handlers::schools::try_handle,
    handlers::teachers::try_handle,
    handlers::classes::try_handle,
    handlers::students::try_handle,
    handlers::attendance::try_handle,
    handlers::notifications::try_handle,
    handlers::setup::try_handle,
    handlers::reports::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> Value {
    debug!(id = %req.id, method = %req.method, "request");
    for try_handle in HANDLERS {
        if let Some(resp) = try_handle(state, &req) {
            return resp;
        }
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

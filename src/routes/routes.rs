//! Defines routes for the Swift-compatible emulator.
//!
//! ## Structure
//! - **Auth endpoints**
//!   - `GET  /auth/v1.0`       - Swift v1 (`X-Auth-User` / `X-Auth-Key`)
//!   - `POST /v2.0/tokens`     - Keystone v2
//!   - `POST /v3/auth/tokens`  - Keystone v3
//!
//! - **Container-level endpoints**
//!   - `GET    /v1/{account}/{container}` - list objects (prefix, delimiter, marker, limit)
//!   - `HEAD   /v1/{account}/{container}` - existence probe
//!   - `PUT    /v1/{account}/{container}` - create container
//!   - `DELETE /v1/{account}/{container}` - delete empty container
//!
//! - **Object-level endpoints**
//!   - `PUT    /v1/{account}/{container}/{*object}` - upload object or manifest
//!   - `GET    /v1/{account}/{container}/{*object}` - download object (Range aware)
//!   - `HEAD   /v1/{account}/{container}/{*object}` - metadata only
//!   - `DELETE /v1/{account}/{container}/{*object}` - delete object
//!
//! The wildcard `*object` allows nested names like `photos/2025/img.jpg`.

use crate::handlers::{
    EmulatorState,
    health_handlers::{healthz, readyz},
    swift_handlers::{
        auth_v1, auth_v2, auth_v3, create_container, delete_container, delete_object,
        get_object, head_account, head_container, head_object, list_container, put_object,
    },
};
use axum::{
    Router,
    routing::{get, head, post, put},
};

/// Build and return the router for all Swift-compatible routes.
///
/// The router carries shared state (`EmulatorState`) to all handlers.
pub fn routes() -> Router<EmulatorState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // auth
        .route("/auth/v1.0", get(auth_v1))
        .route("/v2.0/tokens", post(auth_v2))
        .route("/v3/auth/tokens", post(auth_v3))
        // Object-level routes
        .route(
            "/v1/{account}/{container}/{*object}",
            put(put_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object),
        )
        // Container-level routes
        .route(
            "/v1/{account}/{container}",
            get(list_container)
                .head(head_container)
                .put(create_container)
                .delete(delete_container),
        )
        .route("/v1/{account}", head(head_account))
}

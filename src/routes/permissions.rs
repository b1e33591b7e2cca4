use crate::{
    AppState, handlers,
    models::{Action, Role},
    policy::{HandlerKey, PolicyRegistryBuilder, rbac},
    routes::protect,
};
use axum::{
    Router,
    routing::{get, put},
};

pub const LIST_PERMISSIONS: HandlerKey = HandlerKey::new("permissions.list");
pub const UPDATE_PERMISSION: HandlerKey = HandlerKey::new("permissions.update");

const ENTITY: &str = "permissions";

pub fn register_policies(builder: PolicyRegistryBuilder) -> PolicyRegistryBuilder {
    builder
        .register(LIST_PERMISSIONS, rbac(&[Role::Admin], Action::Read, ENTITY))
        .register(UPDATE_PERMISSION, rbac(&[Role::Admin], Action::Update, ENTITY))
}

/// Permissions Router Module
///
/// Admin-only view and edit of the permission matrix. Writes go through the
/// permission store, which keeps the optional cache consistent.
pub fn permission_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        // GET /permissions
        .route(
            "/permissions",
            protect(get(handlers::list_permissions), state, LIST_PERMISSIONS),
        )
        // PUT /permissions/{role}/{entity}
        .route(
            "/permissions/{role}/{entity}",
            protect(put(handlers::update_permission), state, UPDATE_PERMISSION),
        )
}

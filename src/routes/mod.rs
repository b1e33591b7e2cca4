//! Router Module Index
//!
//! Public routes carry no guard. Every protected route is wrapped individually by
//! `protect`, which binds it to its `HandlerKey`; the matching declaration lives
//! next to the route in the same module and is collected by `policies`.

use axum::{extract::FromRef, middleware, routing::MethodRouter};

use crate::{
    AppState,
    policy::{HandlerKey, PolicyError, PolicyRegistry},
    rbac::{self, AccessPipeline, RouteGuard},
};

/// Routes open to anonymous callers: health check and registration.
pub mod public;

/// The book catalog, guarded per handler.
pub mod books;

/// Administration of the permission matrix, guarded per handler.
pub mod permissions;

/// protect
///
/// Puts the access pipeline in front of `route`, keyed by `key`. The key's
/// declaration must be registered in `policies`, otherwise every call fails closed.
pub fn protect(
    route: MethodRouter<AppState>,
    state: &AppState,
    key: HandlerKey,
) -> MethodRouter<AppState> {
    let guard = RouteGuard {
        pipeline: AccessPipeline::from_ref(state),
        key,
    };
    route.route_layer(middleware::from_fn_with_state(guard, rbac::guard_route))
}

/// policies
///
/// Builds the registry of every route declaration in the application.
pub fn policies() -> Result<PolicyRegistry, PolicyError> {
    let builder = PolicyRegistry::builder();
    let builder = books::register_policies(builder);
    let builder = permissions::register_policies(builder);
    builder.build()
}

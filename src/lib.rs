use axum::{
    Router,
    extract::FromRef,
    http::HeaderName,
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

// Access pipeline: identity resolution, route declarations, policy enforcement.
pub mod auth;
pub mod policy;
pub mod rbac;

// Collaborators and catalog services.
pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repository;
pub mod routes;

use routes::{books, permissions, public};

// --- Public Re-exports ---

pub use auth::CallerIdentity;
pub use cache::CachedPermissionLookup;
pub use config::AppConfig;
pub use error::{AppError, AuthError, LookupError};
pub use policy::{HandlerKey, PolicyRegistry, PolicyState, RoutePolicy};
pub use rbac::AccessPipeline;
pub use repository::{
    DirectoryState, InMemoryRepository, PermissionState, PostgresRepository, RepositoryState,
};

/// Header used to correlate every log line and response of one request.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// ApiDoc
///
/// OpenAPI document for the catalog, served at `/api-docs/openapi.json` and
/// rendered by Swagger UI under `/library/api/v1/docs`.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::register_user, handlers::create_book, handlers::find_all_books,
        handlers::find_book, handlers::update_book, handlers::delete_book,
        handlers::list_permissions, handlers::update_permission
    ),
    components(
        schemas(
            models::User, models::RegisterUserRequest, models::Role, models::Action,
            models::BookResponse, models::CreateBookRequest, models::UpdateBookRequest,
            models::BookPage, models::MessageResponse, models::PermissionRecord,
            models::UpdatePermissionRequest,
        )
    ),
    tags(
        (name = "library", description = "API for stock management of books to small libraries")
    )
)]
pub struct ApiDoc;

/// AppState
///
/// The single shared state handed to every handler and guard. All services sit
/// behind `Arc`, so cloning per request is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Users and books.
    pub repo: RepositoryState,
    /// Caller Directory consumed by the identity resolver.
    pub directory: DirectoryState,
    /// Permission matrix consumed by the policy enforcer, possibly cached.
    pub permissions: PermissionState,
    /// Route declarations, frozen at startup.
    pub policies: PolicyState,
    pub config: AppConfig,
}

impl AppState {
    /// new
    ///
    /// Builds the route declaration table and, when `config.permission_cache` is
    /// set, wraps the permission store in `CachedPermissionLookup`.
    pub fn new(
        repo: RepositoryState,
        directory: DirectoryState,
        permissions: PermissionState,
        config: AppConfig,
    ) -> Result<Self, policy::PolicyError> {
        let policies = Arc::new(routes::policies()?);
        let permissions = if config.permission_cache {
            Arc::new(CachedPermissionLookup::new(permissions)) as PermissionState
        } else {
            permissions
        };
        Ok(Self {
            repo,
            directory,
            permissions,
            policies,
            config,
        })
    }

    /// Backs every collaborator with one `InMemoryRepository`.
    pub fn in_memory(
        store: Arc<InMemoryRepository>,
        config: AppConfig,
    ) -> Result<Self, policy::PolicyError> {
        Self::new(store.clone(), store.clone(), store, config)
    }
}

// --- Axum FromRef Extractor Implementations ---

impl FromRef<AppState> for RepositoryState {
    fn from_ref(app_state: &AppState) -> RepositoryState {
        app_state.repo.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

/// create_router
///
/// Assembles public and protected routes, then applies the correlation-id,
/// tracing and CORS layers around all of them.
pub fn create_router(state: AppState) -> Router {
    // 1. CORS, fully open.
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let correlation_id = HeaderName::from_static(CORRELATION_ID_HEADER);

    // 2. Versioned API. Every route in here is wrapped by `routes::protect`, so
    // each handler already carries its own access pipeline and declaration key.
    let api = Router::new()
        .merge(books::book_routes(&state))
        .merge(permissions::permission_routes(&state));

    // 3. Base router: docs and public routes sit outside the access pipeline.
    let base_router = Router::new()
        // Swagger UI plus the raw OpenAPI document.
        .merge(
            SwaggerUi::new("/library/api/v1/docs").url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        // Health check and registration; no api key needed.
        .merge(public::public_routes())
        .nest("/api/v1", api)
        .with_state(state);

    // 4. Observability layers, outermost first.
    base_router
        .layer(
            ServiceBuilder::new()
                // 4a. Correlation id: keeps the client's value, otherwise mints a UUID.
                .layer(SetRequestIdLayer::new(
                    correlation_id.clone(),
                    MakeRequestUuid,
                ))
                // 4b. One `http_request` span per request. Pipeline rejections
                // are logged inside it, tagged with the correlation id.
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                // 4c. Echoes the correlation id on every response, including
                // 401/403/500 produced by the guards.
                .layer(PropagateRequestIdLayer::new(correlation_id)),
        )
        // 5. CORS last, so preflight requests never reach the guards.
        .layer(cors)
}

/// trace_span_logger
///
/// Opens the per-request span, tagged with the correlation id so every log line of
/// the request (including access pipeline rejections) can be grouped.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let correlation_id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        correlation_id = %correlation_id,
    )
}

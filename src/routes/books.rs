use crate::{
    AppState, handlers,
    models::{Action, Role},
    policy::{HandlerKey, PolicyRegistryBuilder, rbac},
    routes::protect,
};
use axum::{
    Router,
    routing::{delete, get, patch, post},
};

pub const CREATE_BOOK: HandlerKey = HandlerKey::new("books.create");
pub const LIST_BOOKS: HandlerKey = HandlerKey::new("books.list");
pub const FIND_BOOK: HandlerKey = HandlerKey::new("books.find");
pub const UPDATE_BOOK: HandlerKey = HandlerKey::new("books.update");
pub const DELETE_BOOK: HandlerKey = HandlerKey::new("books.delete");

const ENTITY: &str = "books";

/// Declarations for every book handler.
pub fn register_policies(builder: PolicyRegistryBuilder) -> PolicyRegistryBuilder {
    builder
        .register(CREATE_BOOK, rbac(&[Role::Admin], Action::Write, ENTITY))
        .register(LIST_BOOKS, rbac(&[Role::Admin, Role::User], Action::Read, ENTITY))
        .register(FIND_BOOK, rbac(&[Role::Admin, Role::User], Action::Read, ENTITY))
        .register(UPDATE_BOOK, rbac(&[Role::Admin], Action::Update, ENTITY))
        .register(DELETE_BOOK, rbac(&[Role::Admin], Action::Delete, ENTITY))
}

/// Books Router Module
///
/// Catalog CRUD. Each method is guarded on its own so that, for instance, `GET` and
/// `PATCH` on the same path carry different declarations.
pub fn book_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        // POST /books, GET /books?author=&genre=&publish_date=&page=
        .route(
            "/books",
            protect(post(handlers::create_book), state, CREATE_BOOK)
                .merge(protect(get(handlers::find_all_books), state, LIST_BOOKS)),
        )
        // GET / PATCH / DELETE /books/{isbn}
        .route(
            "/books/{isbn}",
            protect(get(handlers::find_book), state, FIND_BOOK)
                .merge(protect(patch(handlers::update_book), state, UPDATE_BOOK))
                .merge(protect(delete(handlers::delete_book), state, DELETE_BOOK)),
        )
}

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use chrono::{NaiveDate, Utc};
use library_catalog::{
    AppConfig, AppState, CORRELATION_ID_HEADER, create_router,
    auth::API_KEY_HEADER,
    models::{Book, BookPage, BookResponse, MessageResponse, PermissionRecord, Role, User},
    policy::PolicyRegistry,
    repository::InMemoryRepository,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::util::ServiceExt;
use uuid::Uuid;

// --- Fixtures ---

const ADMIN_KEY: &str = "abc123";
const USER_KEY: &str = "def456";

fn user(role: Role, api_key: &str) -> User {
    User {
        id: Uuid::new_v4(),
        name: format!("{role} user"),
        email: format!("{role}@example.com"),
        role,
        api_key: api_key.to_string(),
    }
}

fn permission(role: Role, entity: &str, flags: [bool; 4]) -> PermissionRecord {
    let [write, read, update, delete] = flags;
    PermissionRecord {
        role,
        entity: entity.to_string(),
        write,
        read,
        update,
        delete,
    }
}

fn book(isbn: &str, author: &str, genre: &str) -> Book {
    let now = Utc::now();
    Book {
        isbn: isbn.to_string(),
        author: author.to_string(),
        title: format!("A book by {author}"),
        genre: genre.to_string(),
        publish_date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

/// The seeded matrix: admins can do everything on books and administer
/// permissions, users can only read books.
fn seeded_store() -> InMemoryRepository {
    InMemoryRepository::new()
        .with_user(user(Role::Admin, ADMIN_KEY))
        .with_user(user(Role::User, USER_KEY))
        .with_permission(permission(Role::Admin, "books", [true, true, true, true]))
        .with_permission(permission(Role::User, "books", [false, true, false, false]))
        .with_permission(permission(Role::Admin, "permissions", [false, true, true, false]))
}

fn app_with(store: InMemoryRepository) -> Router {
    let state = AppState::in_memory(Arc::new(store), AppConfig::default()).unwrap();
    create_router(state)
}

async fn send(app: &Router, method: Method, uri: &str, key: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header(API_KEY_HEADER, key);
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn new_book_body() -> Value {
    json!({
        "isbn": "978-3-16-148410-0",
        "author": "Octavia Butler",
        "title": "Kindred",
        "genre": "Fiction",
        "publish_date": "1979-06-01"
    })
}

// --- Access pipeline through the router ---

#[tokio::test]
async fn test_admin_can_create_book() {
    let app = app_with(seeded_store());

    let (status, body) = send(&app, Method::POST, "/api/v1/books", Some(ADMIN_KEY), Some(new_book_body())).await;

    assert_eq!(status, StatusCode::CREATED);
    let created: BookResponse = serde_json::from_value(body).unwrap();
    assert_eq!(created.isbn, "9783161484100");
    assert_eq!(created.publish_date, "01-Jun-1979");
}

#[tokio::test]
async fn test_missing_api_key_is_401() {
    let app = app_with(seeded_store());

    let (status, body) = send(&app, Method::POST, "/api/v1/books", None, Some(new_book_body())).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["statusCode"], 401);
}

#[tokio::test]
async fn test_unknown_and_missing_key_are_indistinguishable() {
    let app = app_with(seeded_store());

    let (missing_status, missing_body) = send(&app, Method::GET, "/api/v1/books", None, None).await;
    let (unknown_status, unknown_body) = send(&app, Method::GET, "/api/v1/books", Some("nope"), None).await;

    assert_eq!(missing_status, unknown_status);
    assert_eq!(missing_body, unknown_body);
}

#[tokio::test]
async fn test_user_role_cannot_create_book() {
    let app = app_with(seeded_store());

    let (status, _) = send(&app, Method::POST, "/api/v1/books", Some(USER_KEY), Some(new_book_body())).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_denied_flag_is_403_even_for_admin() {
    let store = seeded_store().with_permission(permission(Role::Admin, "books", [false, true, true, true]));
    let app = app_with(store);

    let (status, body) = send(&app, Method::POST, "/api/v1/books", Some(ADMIN_KEY), Some(new_book_body())).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["statusCode"], 403);
}

#[tokio::test]
async fn test_missing_permission_record_is_500_with_generic_message() {
    let store = InMemoryRepository::new().with_user(user(Role::User, USER_KEY));
    let app = app_with(store);

    let (status, body) = send(&app, Method::GET, "/api/v1/books", Some(USER_KEY), None).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["message"], "An unexpected error occurred");
}

#[tokio::test]
async fn test_route_without_declaration_fails_closed() {
    // Same routes, but an empty declaration table.
    let store = Arc::new(seeded_store());
    let mut state = AppState::in_memory(store, AppConfig::default()).unwrap();
    state.policies = Arc::new(PolicyRegistry::builder().build().unwrap());
    let app = create_router(state);

    let (status, _) = send(&app, Method::GET, "/api/v1/books", Some(ADMIN_KEY), None).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_same_path_methods_carry_their_own_policy() {
    let store = seeded_store().with_book(book("9783161484100", "Author", "Drama"));
    let app = app_with(store);

    let (read_status, _) = send(&app, Method::GET, "/api/v1/books/9783161484100", Some(USER_KEY), None).await;
    let (delete_status, _) = send(&app, Method::DELETE, "/api/v1/books/9783161484100", Some(USER_KEY), None).await;

    assert_eq!(read_status, StatusCode::OK);
    assert_eq!(delete_status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_public_routes_need_no_key() {
    let app = app_with(seeded_store());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(CORRELATION_ID_HEADER));
}

// --- Books ---

#[tokio::test]
async fn test_duplicate_isbn_is_conflict() {
    let app = app_with(seeded_store());

    send(&app, Method::POST, "/api/v1/books", Some(ADMIN_KEY), Some(new_book_body())).await;
    let (status, _) = send(&app, Method::POST, "/api/v1/books", Some(ADMIN_KEY), Some(new_book_body())).await;

    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_invalid_book_is_400_with_messages() {
    let app = app_with(seeded_store());
    let mut body = new_book_body();
    body["isbn"] = json!("123");

    let (status, body) = send(&app, Method::POST, "/api/v1/books", Some(ADMIN_KEY), Some(body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"][0], "isbn must be a valid 10 or 13 format");
}

#[tokio::test]
async fn test_list_paginates_five_per_page() {
    let mut store = seeded_store();
    for i in 0..7 {
        store = store.with_book(book(&format!("isbn-{i}"), "Author", "Drama"));
    }
    let app = app_with(store);

    let (status, body) = send(&app, Method::GET, "/api/v1/books?page=2", Some(USER_KEY), None).await;

    assert_eq!(status, StatusCode::OK);
    let page: BookPage = serde_json::from_value(body).unwrap();
    assert_eq!(page.total, 7);
    assert_eq!(page.page, 2);
    assert_eq!(page.last_page, 2);
    assert_eq!(page.books.len(), 2);
}

#[tokio::test]
async fn test_list_filters_by_author_and_genre() {
    let store = seeded_store()
        .with_book(book("isbn-1", "Le Guin", "Fantasy"))
        .with_book(book("isbn-2", "Le Guin", "Science"))
        .with_book(book("isbn-3", "Butler", "Fantasy"));
    let app = app_with(store);

    let (status, body) = send(&app, Method::GET, "/api/v1/books?author=Le%20Guin&genre=Fantasy", Some(USER_KEY), None).await;

    assert_eq!(status, StatusCode::OK);
    let page: BookPage = serde_json::from_value(body).unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.books[0].isbn, "isbn-1");
}

#[tokio::test]
async fn test_page_out_of_range_is_400() {
    let store = seeded_store().with_book(book("isbn-1", "Author", "Drama"));
    let app = app_with(store);

    let (status, body) = send(&app, Method::GET, "/api/v1/books?page=3", Some(USER_KEY), None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["message"],
        "Requested page 3 is out of range. Total books: 1. Last page: 1. Select a page in range of results."
    );
}

#[tokio::test]
async fn test_empty_result_is_404() {
    let app = app_with(seeded_store());

    let (status, _) = send(&app, Method::GET, "/api/v1/books", Some(USER_KEY), None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_update_then_read_back() {
    let store = seeded_store().with_book(book("9783161484100", "Author", "Drama"));
    let app = app_with(store);

    let (status, body) = send(
        &app,
        Method::PATCH,
        "/api/v1/books/9783161484100",
        Some(ADMIN_KEY),
        Some(json!({ "title": "Renamed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let ack: MessageResponse = serde_json::from_value(body).unwrap();
    assert_eq!(ack, MessageResponse::ok("Book updated successfully."));

    let (_, body) = send(&app, Method::GET, "/api/v1/books/9783161484100", Some(USER_KEY), None).await;
    assert_eq!(body["title"], "Renamed");
    assert_eq!(body["genre"], "Drama");
}

#[tokio::test]
async fn test_soft_deleted_book_disappears() {
    let store = seeded_store().with_book(book("9783161484100", "Author", "Drama"));
    let app = app_with(store);

    let (status, body) = send(&app, Method::DELETE, "/api/v1/books/9783161484100", Some(ADMIN_KEY), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Book marked as deleted successfully.");

    let (status, _) = send(&app, Method::GET, "/api/v1/books/9783161484100", Some(ADMIN_KEY), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, Method::DELETE, "/api/v1/books/9783161484100", Some(ADMIN_KEY), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// --- Permissions administration ---

#[tokio::test]
async fn test_permission_change_applies_to_next_request() {
    let app = app_with(seeded_store());

    let (status, _) = send(&app, Method::POST, "/api/v1/books", Some(USER_KEY), Some(new_book_body())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Granting the flag is not enough: the route declaration still excludes `user`.
    let (status, body) = send(
        &app,
        Method::PUT,
        "/api/v1/permissions/user/books",
        Some(ADMIN_KEY),
        Some(json!({ "write": true, "read": true, "update": false, "delete": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["write"], true);

    let (status, _) = send(&app, Method::POST, "/api/v1/books", Some(USER_KEY), Some(new_book_body())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Revoking read on books takes effect immediately.
    send(
        &app,
        Method::PUT,
        "/api/v1/permissions/user/books",
        Some(ADMIN_KEY),
        Some(json!({ "write": false, "read": false, "update": false, "delete": false })),
    )
    .await;
    let (status, _) = send(&app, Method::GET, "/api/v1/books", Some(USER_KEY), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_permission_change_invalidates_cache() {
    let config = AppConfig {
        permission_cache: true,
        ..AppConfig::default()
    };
    let state = AppState::in_memory(Arc::new(seeded_store()), config).unwrap();
    let app = create_router(state);

    let (status, _) = send(&app, Method::GET, "/api/v1/books", Some(USER_KEY), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(
        &app,
        Method::PUT,
        "/api/v1/permissions/user/books",
        Some(ADMIN_KEY),
        Some(json!({ "write": false, "read": false, "update": false, "delete": false })),
    )
    .await;

    let (status, _) = send(&app, Method::GET, "/api/v1/books", Some(USER_KEY), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_only_admin_lists_permissions() {
    let app = app_with(seeded_store());

    let (status, body) = send(&app, Method::GET, "/api/v1/permissions", Some(ADMIN_KEY), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 3);

    let (status, _) = send(&app, Method::GET, "/api/v1/permissions", Some(USER_KEY), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// --- Registration ---

#[tokio::test]
async fn test_register_issues_working_api_key() {
    let app = app_with(seeded_store());

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/auth/register",
        None,
        Some(json!({ "name": "Grace", "email": "grace@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let registered: User = serde_json::from_value(body).unwrap();
    assert_eq!(registered.role, Role::User);
    assert_eq!(registered.api_key.len(), 40);

    // New users read books like any `user`.
    let (status, _) = send(&app, Method::GET, "/api/v1/books", Some(&registered.api_key), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/auth/register",
        None,
        Some(json!({ "name": "Grace again", "email": "grace@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_deleted_isbn_can_be_stocked_again() {
    let app = app_with(seeded_store());

    send(&app, Method::POST, "/api/v1/books", Some(ADMIN_KEY), Some(new_book_body())).await;
    send(&app, Method::DELETE, "/api/v1/books/978-3-16-148410-0", Some(ADMIN_KEY), None).await;

    let (status, _) = send(&app, Method::POST, "/api/v1/books", Some(ADMIN_KEY), Some(new_book_body())).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, Method::GET, "/api/v1/books/978-3-16-148410-0", Some(USER_KEY), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Kindred");
}

#[tokio::test]
async fn test_huge_page_number_is_400_not_a_crash() {
    let store = seeded_store().with_book(book("9783161484100", "Author", "Drama"));
    let app = app_with(store);

    let uri = format!("/api/v1/books?page={}", i64::MAX);
    let (status, body) = send(&app, Method::GET, &uri, Some(USER_KEY), None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["message"],
        format!(
            "Requested page {} is out of range. Total books: 1. Last page: 1. Select a page in range of results.",
            i64::MAX
        )
    );
}

#[tokio::test]
async fn test_malformed_query_is_400_json() {
    let store = seeded_store().with_book(book("9783161484100", "Author", "Drama"));
    let app = app_with(store);

    let (status, body) = send(&app, Method::GET, "/api/v1/books?page=two", Some(USER_KEY), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["statusCode"], 400);
    assert!(body["message"].is_string());

    let (status, body) = send(&app, Method::GET, "/api/v1/books?publish_date=01-01-2023", Some(USER_KEY), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Bad Request");
}

#[tokio::test]
async fn test_isbn_spellings_identify_one_book() {
    let app = app_with(seeded_store());

    let (status, _) = send(&app, Method::POST, "/api/v1/books", Some(ADMIN_KEY), Some(new_book_body())).await;
    assert_eq!(status, StatusCode::CREATED);

    let mut plain = new_book_body();
    plain["isbn"] = json!("9783161484100");
    let (status, _) = send(&app, Method::POST, "/api/v1/books", Some(ADMIN_KEY), Some(plain)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, Method::GET, "/api/v1/books/9783161484100", Some(USER_KEY), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, Method::GET, "/api/v1/books/978-3-16-148410-0", Some(USER_KEY), None).await;
    assert_eq!(status, StatusCode::OK);

    // ISBN-10 check digit `x` is stored upper-case.
    let mut ten = new_book_body();
    ten["isbn"] = json!("0-8044-2957-x");
    let (_, body) = send(&app, Method::POST, "/api/v1/books", Some(ADMIN_KEY), Some(ten)).await;
    assert_eq!(body["isbn"], "080442957X");
}

#[tokio::test]
async fn test_text_fields_are_stored_trimmed() {
    let app = app_with(seeded_store());
    let mut body = new_book_body();
    body["author"] = json!(format!("   {}   ", "a".repeat(50)));
    body["genre"] = json!("  Fiction  ");

    let (status, created) = send(&app, Method::POST, "/api/v1/books", Some(ADMIN_KEY), Some(body)).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["author"], "a".repeat(50));
    assert_eq!(created["genre"], "Fiction");
}

#[tokio::test]
async fn test_register_rejects_email_longer_than_column() {
    let app = app_with(seeded_store());

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/auth/register",
        None,
        Some(json!({ "name": "Grace", "email": "grace.hopper.the.admiral@example.com" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"][0], "email must be shorter than or equal to 30 characters");
}

// --- Store-level conflicts ---

#[tokio::test]
async fn test_store_rejects_live_duplicate_even_without_handler_check() {
    use library_catalog::{
        AppError, LookupError,
        models::CreateBookRequest,
        repository::{DUPLICATE_ISBN, Repository},
    };
    use axum::response::IntoResponse;

    let store = seeded_store();
    let req = CreateBookRequest {
        isbn: "9783161484100".to_string(),
        author: "Octavia Butler".to_string(),
        title: "Kindred".to_string(),
        genre: "Fiction".to_string(),
        publish_date: NaiveDate::from_ymd_opt(1979, 6, 1).unwrap(),
    };

    store.create_book(req.clone()).await.unwrap();
    let err = store.create_book(req).await.unwrap_err();
    assert!(matches!(&err, LookupError::Conflict(msg) if msg == DUPLICATE_ISBN));

    let response = AppError::from(err).into_response();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_store_rejects_duplicate_email() {
    use library_catalog::{LookupError, repository::Repository};

    let store = seeded_store();
    let mut twin = user(Role::User, "another-key");
    twin.email = "admin@example.com".to_string();

    let err = store.create_user(twin).await.unwrap_err();

    assert!(matches!(err, LookupError::Conflict(_)));
}

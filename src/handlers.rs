use crate::{
    AppState,
    auth::CallerIdentity,
    error::{AppError, LookupError},
    models::{
        self, BOOKS_PAGE_SIZE, BookFilter, BookPage, BookResponse, CreateBookRequest,
        MessageResponse, PermissionRecord, RegisterUserRequest, Role, UpdateBookRequest,
        UpdatePermissionRequest, User,
    },
    repository::DUPLICATE_ISBN,
};
use axum::{
    Json,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::StatusCode,
};
use uuid::Uuid;

/// Attempts at drawing an unused API key before giving up.
const API_KEY_ATTEMPTS: usize = 8;

/// generate_api_key
///
/// 20 random bytes rendered as 40 lowercase hex characters.
pub fn generate_api_key() -> String {
    let bytes: [u8; 20] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// --- Auth ---

/// register_user
///
/// [Public Route] Creates a user with the `user` role and a freshly generated API key.
/// The key is drawn until the Caller Directory reports it unused.
#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    request_body = RegisterUserRequest,
    responses(
        (status = 201, description = "Registered", body = User),
        (status = 400, description = "Invalid request, validation failed"),
        (status = 409, description = "Email already registered")
    )
)]
pub async fn register_user(
    State(state): State<AppState>,
    Json(payload): Json<RegisterUserRequest>,
) -> Result<(StatusCode, Json<User>), AppError> {
    let payload = payload.normalized();
    payload.validate().map_err(AppError::Validation)?;

    if state.repo.find_user_by_email(&payload.email).await?.is_some() {
        return Err(AppError::Conflict(format!(
            "a user with email {} already exists",
            payload.email
        )));
    }

    let mut api_key = None;
    for _ in 0..API_KEY_ATTEMPTS {
        let candidate = generate_api_key();
        if state.directory.find_by_api_key(&candidate).await?.is_none() {
            api_key = Some(candidate);
            break;
        }
    }
    let api_key = api_key.ok_or_else(|| {
        LookupError::Unavailable("could not generate an unused api key".to_string())
    })?;

    let user = state
        .repo
        .create_user(User {
            id: Uuid::new_v4(),
            name: payload.name,
            email: payload.email,
            role: Role::User,
            api_key,
        })
        .await?;

    tracing::info!(user_id = %user.id, "user registered");
    Ok((StatusCode::CREATED, Json(user)))
}

// --- Books ---

/// create_book
///
/// [Protected: admin / write / books] Registers a new book.
#[utoipa::path(
    post,
    path = "/api/v1/books",
    params(("x-api-key" = String, Header, description = "Caller API key")),
    request_body = CreateBookRequest,
    responses(
        (status = 201, description = "Created", body = BookResponse),
        (status = 400, description = "Invalid request, validation failed"),
        (status = 401, description = "Invalid or missing api key"),
        (status = 403, description = "Insufficient permissions"),
        (status = 409, description = "A book with this ISBN already exists")
    )
)]
pub async fn create_book(
    caller: CallerIdentity,
    State(state): State<AppState>,
    Json(payload): Json<CreateBookRequest>,
) -> Result<(StatusCode, Json<BookResponse>), AppError> {
    // Validated and stored in canonical form, so `978-0-...` and `9780...` collide.
    let payload = payload.normalized();
    payload.validate().map_err(AppError::Validation)?;

    if state.repo.find_book(&payload.isbn).await?.is_some() {
        return Err(AppError::Conflict(DUPLICATE_ISBN.to_string()));
    }

    let book = state.repo.create_book(payload).await?;
    tracing::info!(isbn = %book.isbn, by = %caller.id, "book created");
    Ok((StatusCode::CREATED, Json(book.into())))
}

/// find_all_books
///
/// [Protected: admin, user / read / books] Lists books matching the filters, five
/// per page.
#[utoipa::path(
    get,
    path = "/api/v1/books",
    params(
        ("x-api-key" = String, Header, description = "Caller API key"),
        BookFilter
    ),
    responses(
        (status = 200, description = "A list of books matching the provided filters.", body = BookPage),
        (status = 400, description = "Requested page number is out of range."),
        (status = 404, description = "No books found matching the provided filters.")
    )
)]
pub async fn find_all_books(
    State(state): State<AppState>,
    filter: Result<Query<BookFilter>, QueryRejection>,
) -> Result<Json<BookPage>, AppError> {
    let Query(filter) = filter?;
    let page = filter.page.unwrap_or(1);
    // Saturates for absurd pages; the range check below turns those into a 400.
    let offset = (page.max(1) - 1).saturating_mul(BOOKS_PAGE_SIZE);

    let (books, total) = state
        .repo
        .find_books(&filter, offset, BOOKS_PAGE_SIZE)
        .await?;

    if total == 0 {
        return Err(AppError::NotFound(
            "There are no books in the database with parameters provided".to_string(),
        ));
    }

    let last_page = models::last_page(total);
    if page < 1 || page > last_page {
        return Err(AppError::BadRequest(format!(
            "Requested page {page} is out of range. Total books: {total}. Last page: {last_page}. Select a page in range of results."
        )));
    }

    Ok(Json(BookPage {
        books: books.into_iter().map(BookResponse::from).collect(),
        total,
        page,
        last_page,
    }))
}

/// find_book
///
/// [Protected: admin, user / read / books] Retrieves a single book by ISBN.
#[utoipa::path(
    get,
    path = "/api/v1/books/{isbn}",
    params(
        ("x-api-key" = String, Header, description = "Caller API key"),
        ("isbn" = String, Path, description = "The ISBN of the book to retrieve.")
    ),
    responses(
        (status = 200, description = "The book found successfully.", body = BookResponse),
        (status = 404, description = "Book not found with the provided ISBN.")
    )
)]
pub async fn find_book(
    State(state): State<AppState>,
    Path(isbn): Path<String>,
) -> Result<Json<BookResponse>, AppError> {
    match state.repo.find_book(&models::normalize_isbn(&isbn)).await? {
        Some(book) => Ok(Json(book.into())),
        None => Err(book_not_found()),
    }
}

/// update_book
///
/// [Protected: admin / update / books] Applies the provided fields to a book.
#[utoipa::path(
    patch,
    path = "/api/v1/books/{isbn}",
    params(
        ("x-api-key" = String, Header, description = "Caller API key"),
        ("isbn" = String, Path, description = "The ISBN of the book to update.")
    ),
    request_body = UpdateBookRequest,
    responses(
        (status = 200, description = "Book updated successfully.", body = MessageResponse),
        (status = 404, description = "Book not found with the provided ISBN.")
    )
)]
pub async fn update_book(
    caller: CallerIdentity,
    State(state): State<AppState>,
    Path(isbn): Path<String>,
    Json(payload): Json<UpdateBookRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let payload = payload.normalized();
    payload.validate().map_err(AppError::Validation)?;

    match state.repo.update_book(&models::normalize_isbn(&isbn), payload).await? {
        Some(book) => {
            tracing::info!(isbn = %book.isbn, by = %caller.id, "book updated");
            Ok(Json(MessageResponse::ok("Book updated successfully.")))
        }
        None => Err(book_not_found()),
    }
}

/// delete_book
///
/// [Protected: admin / delete / books] Soft-deletes a book. The row stays in the
/// table with `deleted_at` set and disappears from every read.
#[utoipa::path(
    delete,
    path = "/api/v1/books/{isbn}",
    params(
        ("x-api-key" = String, Header, description = "Caller API key"),
        ("isbn" = String, Path, description = "The ISBN of the book to delete.")
    ),
    responses(
        (status = 200, description = "Book marked as deleted successfully.", body = MessageResponse),
        (status = 404, description = "Book not found with the provided ISBN.")
    )
)]
pub async fn delete_book(
    caller: CallerIdentity,
    State(state): State<AppState>,
    Path(isbn): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    let isbn = models::normalize_isbn(&isbn);
    if state.repo.soft_delete_book(&isbn).await? {
        tracing::info!(isbn = %isbn, by = %caller.id, "book soft-deleted");
        Ok(Json(MessageResponse::ok("Book marked as deleted successfully.")))
    } else {
        Err(book_not_found())
    }
}

fn book_not_found() -> AppError {
    AppError::NotFound("Book not found with the provided ISBN.".to_string())
}

// --- Permissions ---

/// list_permissions
///
/// [Protected: admin / read / permissions] Returns the whole permission matrix.
#[utoipa::path(
    get,
    path = "/api/v1/permissions",
    params(("x-api-key" = String, Header, description = "Caller API key")),
    responses((status = 200, description = "Permission records", body = [PermissionRecord]))
)]
pub async fn list_permissions(
    State(state): State<AppState>,
) -> Result<Json<Vec<PermissionRecord>>, AppError> {
    Ok(Json(state.permissions.list_permissions().await?))
}

/// update_permission
///
/// [Protected: admin / update / permissions] Creates or replaces the flags for one
/// (role, entity) pair. Takes effect on the next request.
#[utoipa::path(
    put,
    path = "/api/v1/permissions/{role}/{entity}",
    params(
        ("x-api-key" = String, Header, description = "Caller API key"),
        ("role" = Role, Path, description = "Role the record applies to"),
        ("entity" = String, Path, description = "Entity the record applies to")
    ),
    request_body = UpdatePermissionRequest,
    responses((status = 200, description = "Saved", body = PermissionRecord))
)]
pub async fn update_permission(
    caller: CallerIdentity,
    State(state): State<AppState>,
    Path((role, entity)): Path<(Role, String)>,
    Json(payload): Json<UpdatePermissionRequest>,
) -> Result<Json<PermissionRecord>, AppError> {
    let record = PermissionRecord {
        role,
        entity,
        write: payload.write,
        read: payload.read,
        update: payload.update,
        delete: payload.delete,
    };
    let saved = state.permissions.upsert_permission(record).await?;
    tracing::info!(
        role = %saved.role,
        entity = %saved.entity,
        by = %caller.id,
        "permission record updated"
    );
    Ok(Json(saved))
}

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use ts_rs::TS;
use utoipa::ToSchema;
use uuid::Uuid;

/// Page size used by the book listing endpoint.
pub const BOOKS_PAGE_SIZE: i64 = 5;

// --- Access Control Vocabulary ---

/// Role
///
/// The closed set of caller roles. Stored in Postgres as the `roles` enum type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS, ToSchema,
    sqlx::Type,
)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "roles", rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action
///
/// The closed action vocabulary a route can declare. Each action maps to one
/// capability flag on a `PermissionRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Write,
    Read,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Write => "write",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PermissionRecord
///
/// One row of the `permissions` table: the capability flags a role holds on an
/// entity. `(role, entity)` is the primary key, so a lookup yields one record or none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema, FromRow)]
#[ts(export)]
pub struct PermissionRecord {
    pub role: Role,
    pub entity: String,
    pub write: bool,
    pub read: bool,
    pub update: bool,
    pub delete: bool,
}

impl PermissionRecord {
    /// Returns the flag matching `action`.
    pub fn allows(&self, action: Action) -> bool {
        match action {
            Action::Write => self.write,
            Action::Read => self.read,
            Action::Update => self.update,
            Action::Delete => self.delete,
        }
    }
}

/// UpdatePermissionRequest
///
/// Input payload for `PUT /permissions/{role}/{entity}`.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdatePermissionRequest {
    pub write: bool,
    pub read: bool,
    pub update: bool,
    pub delete: bool,
}

// --- Users ---

/// User
///
/// A registered library user as stored in the `users` table. The `api_key` is the
/// credential the identity resolver matches against `x-api-key`.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub api_key: String,
}

/// RegisterUserRequest
///
/// Input payload for the public registration endpoint (POST /auth/register).
/// Role and API key are assigned by the server.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct RegisterUserRequest {
    pub name: String,
    pub email: String,
}

/// Column widths of the `users` table.
const USER_NAME_MAX: usize = 50;
const USER_EMAIL_MAX: usize = 30;

impl RegisterUserRequest {
    /// Trims both fields; the trimmed values are what gets validated and stored.
    pub fn normalized(self) -> Self {
        Self {
            name: self.name.trim().to_string(),
            email: self.email.trim().to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("name must be a non-empty string".to_string());
        } else if self.name.chars().count() > USER_NAME_MAX {
            errors.push(format!(
                "name must be shorter than or equal to {USER_NAME_MAX} characters"
            ));
        }
        if !looks_like_email(&self.email) {
            errors.push("email must be a valid email".to_string());
        } else if self.email.chars().count() > USER_EMAIL_MAX {
            errors.push(format!(
                "email must be shorter than or equal to {USER_EMAIL_MAX} characters"
            ));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.starts_with('.')
                && domain.contains('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}

// --- Books ---

/// Book
///
/// A catalog entry from the `books` table. `deleted_at` marks a soft delete; the
/// repository never returns rows where it is set.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow)]
#[ts(export)]
pub struct Book {
    pub isbn: String,
    pub author: String,
    pub title: String,
    pub genre: String,
    pub publish_date: NaiveDate,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
    #[ts(type = "string | null")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// BookResponse
///
/// The client-facing view of a book. `publish_date` is rendered as `dd-Mon-yyyy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct BookResponse {
    #[schema(example = "978-3-16-148410-0")]
    pub isbn: String,
    pub author: String,
    pub title: String,
    pub genre: String,
    #[schema(example = "01-Jan-2023")]
    pub publish_date: String,
}

impl From<Book> for BookResponse {
    fn from(book: Book) -> Self {
        Self {
            publish_date: book.publish_date.format("%d-%b-%Y").to_string(),
            isbn: book.isbn,
            author: book.author,
            title: book.title,
            genre: book.genre,
        }
    }
}

/// CreateBookRequest
///
/// Input payload for POST /books.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CreateBookRequest {
    #[schema(example = "978-3-16-148410-0")]
    pub isbn: String,
    pub author: String,
    pub title: String,
    pub genre: String,
    #[schema(example = "2023-01-01")]
    pub publish_date: NaiveDate,
}

impl CreateBookRequest {
    /// Canonical ISBN and trimmed text fields, as stored.
    pub fn normalized(self) -> Self {
        Self {
            isbn: normalize_isbn(&self.isbn),
            author: self.author.trim().to_string(),
            title: self.title.trim().to_string(),
            genre: self.genre.trim().to_string(),
            publish_date: self.publish_date,
        }
    }

    /// Collects every rule violation instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if !is_valid_isbn(&self.isbn) {
            errors.push("isbn must be a valid 10 or 13 format".to_string());
        }
        check_length(&mut errors, "author", &self.author, 3, 50);
        check_length(&mut errors, "title", &self.title, 3, 50);
        check_length(&mut errors, "genre", &self.genre, 3, 20);
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// UpdateBookRequest
///
/// Partial update payload for PATCH /books/{isbn}. Absent fields are left untouched.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdateBookRequest {
    pub author: Option<String>,
    pub title: Option<String>,
    pub genre: Option<String>,
    pub publish_date: Option<NaiveDate>,
}

impl UpdateBookRequest {
    pub fn normalized(self) -> Self {
        let trim = |value: Option<String>| value.map(|v| v.trim().to_string());
        Self {
            author: trim(self.author),
            title: trim(self.title),
            genre: trim(self.genre),
            publish_date: self.publish_date,
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if let Some(author) = &self.author {
            check_length(&mut errors, "author", author, 3, 50);
        }
        if let Some(title) = &self.title {
            check_length(&mut errors, "title", title, 3, 50);
        }
        if let Some(genre) = &self.genre {
            check_length(&mut errors, "genre", genre, 3, 20);
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn check_length(errors: &mut Vec<String>, field: &str, value: &str, min: usize, max: usize) {
    let len = value.trim().chars().count();
    if len < min || len > max {
        errors.push(format!(
            "The {field} must have between {min} and {max} letters"
        ));
    }
}

/// normalize_isbn
///
/// Drops hyphens and spaces and upper-cases a trailing `x`, so every spelling of
/// one ISBN maps to the same key.
pub fn normalize_isbn(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// is_valid_isbn
///
/// Accepts ISBN-10 (last digit may be `X`) and ISBN-13, ignoring hyphens and spaces,
/// and verifies the check digit.
pub fn is_valid_isbn(raw: &str) -> bool {
    let chars: Vec<char> = raw.chars().filter(|c| *c != '-' && *c != ' ').collect();
    match chars.len() {
        10 => {
            let mut sum = 0u32;
            for (i, c) in chars.iter().enumerate() {
                let value = match c.to_digit(10) {
                    Some(d) => d,
                    None if i == 9 && (*c == 'X' || *c == 'x') => 10,
                    None => return false,
                };
                sum += value * (10 - i as u32);
            }
            sum % 11 == 0
        }
        13 => {
            let mut sum = 0u32;
            for (i, c) in chars.iter().enumerate() {
                let Some(d) = c.to_digit(10) else {
                    return false;
                };
                sum += if i % 2 == 0 { d } else { d * 3 };
            }
            sum % 10 == 0
        }
        _ => false,
    }
}

/// BookFilter
///
/// Query parameters accepted by GET /books.
#[derive(Debug, Clone, Default, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct BookFilter {
    /// Filter books by author name.
    pub author: Option<String>,
    /// Filter books by genre.
    pub genre: Option<String>,
    /// Filter books by publication date, format YYYY-MM-DD.
    pub publish_date: Option<NaiveDate>,
    /// Page number for pagination (default is 1).
    pub page: Option<i64>,
}

/// BookPage
///
/// One page of filtered books plus the pagination summary.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct BookPage {
    pub books: Vec<BookResponse>,
    pub total: i64,
    pub page: i64,
    pub last_page: i64,
}

/// last_page
///
/// Number of pages needed for `total` items at `BOOKS_PAGE_SIZE` per page.
pub fn last_page(total: i64) -> i64 {
    (total + BOOKS_PAGE_SIZE - 1) / BOOKS_PAGE_SIZE
}

/// MessageResponse
///
/// Acknowledgement body for update and delete operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct MessageResponse {
    pub success: String,
    pub message: String,
}

impl MessageResponse {
    pub fn ok(message: &str) -> Self {
        Self {
            success: "true".to_string(),
            message: message.to_string(),
        }
    }
}

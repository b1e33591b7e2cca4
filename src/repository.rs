use crate::{
    error::LookupError,
    models::{Book, BookFilter, CreateBookRequest, PermissionRecord, Role, UpdateBookRequest, User},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, query_builder::QueryBuilder};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

/// CallerDirectory
///
/// The lookup the identity resolver consumes: find the user owning an API key.
/// Matching is exact; `Ok(None)` means no such user.
#[async_trait]
pub trait CallerDirectory: Send + Sync {
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<User>, LookupError>;
}

/// PermissionLookup
///
/// The read the policy enforcer consumes. Returns the single record for
/// `(role, entity)` or `Ok(None)`; implementations must never synthesize a default.
#[async_trait]
pub trait PermissionLookup: Send + Sync {
    async fn find_permission(
        &self,
        role: Role,
        entity: &str,
    ) -> Result<Option<PermissionRecord>, LookupError>;
}

/// PermissionStore
///
/// The full permission matrix, readable and writable. Writes go through here so a
/// caching wrapper can invalidate itself.
#[async_trait]
pub trait PermissionStore: PermissionLookup {
    async fn list_permissions(&self) -> Result<Vec<PermissionRecord>, LookupError>;
    async fn upsert_permission(
        &self,
        record: PermissionRecord,
    ) -> Result<PermissionRecord, LookupError>;
}

/// Repository
///
/// Persistence contract for the catalog itself: users and books.
#[async_trait]
pub trait Repository: Send + Sync {
    // --- Users ---
    async fn create_user(&self, user: User) -> Result<User, LookupError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, LookupError>;

    // --- Books ---
    async fn create_book(&self, req: CreateBookRequest) -> Result<Book, LookupError>;
    // Soft-deleted books are never returned.
    async fn find_book(&self, isbn: &str) -> Result<Option<Book>, LookupError>;
    // Returns the requested slice and the total match count.
    async fn find_books(
        &self,
        filter: &BookFilter,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Book>, i64), LookupError>;
    async fn update_book(
        &self,
        isbn: &str,
        req: UpdateBookRequest,
    ) -> Result<Option<Book>, LookupError>;
    // Sets `deleted_at`. Returns false when no live book matched.
    async fn soft_delete_book(&self, isbn: &str) -> Result<bool, LookupError>;
}

pub type RepositoryState = Arc<dyn Repository>;
pub type DirectoryState = Arc<dyn CallerDirectory>;
pub type PermissionState = Arc<dyn PermissionStore>;

pub const DUPLICATE_ISBN: &str = "A book with this ISBN already exists.";
pub const DUPLICATE_USER: &str = "A user with this email already exists.";

const USER_COLUMNS: &str = "id, name, email, role, api_key";
const BOOK_COLUMNS: &str =
    "isbn, author, title, genre, publish_date, created_at, updated_at, deleted_at";
const PERMISSION_COLUMNS: &str = r#"role, entity, "write", "read", "update", "delete""#;

/// PostgresRepository
///
/// Implements every persistence trait against PostgreSQL. Queries are built at
/// runtime so the crate builds without a live database.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallerDirectory for PostgresRepository {
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<User>, LookupError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE api_key = $1"
        ))
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }
}

#[async_trait]
impl PermissionLookup for PostgresRepository {
    async fn find_permission(
        &self,
        role: Role,
        entity: &str,
    ) -> Result<Option<PermissionRecord>, LookupError> {
        let record = sqlx::query_as::<_, PermissionRecord>(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions \
             WHERE role = $1 AND entity = $2 AND deleted_at IS NULL"
        ))
        .bind(role)
        .bind(entity)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}

#[async_trait]
impl PermissionStore for PostgresRepository {
    async fn list_permissions(&self) -> Result<Vec<PermissionRecord>, LookupError> {
        let records = sqlx::query_as::<_, PermissionRecord>(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions \
             WHERE deleted_at IS NULL ORDER BY entity, role"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// upsert_permission
    ///
    /// Relies on the `(role, entity)` primary key; a soft-deleted row is revived.
    async fn upsert_permission(
        &self,
        record: PermissionRecord,
    ) -> Result<PermissionRecord, LookupError> {
        let saved = sqlx::query_as::<_, PermissionRecord>(&format!(
            r#"INSERT INTO permissions (role, entity, "write", "read", "update", "delete")
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (role, entity) DO UPDATE SET
                   "write" = EXCLUDED."write",
                   "read" = EXCLUDED."read",
                   "update" = EXCLUDED."update",
                   "delete" = EXCLUDED."delete",
                   updated_at = now(),
                   deleted_at = NULL
               RETURNING {PERMISSION_COLUMNS}"#
        ))
        .bind(record.role)
        .bind(&record.entity)
        .bind(record.write)
        .bind(record.read)
        .bind(record.update)
        .bind(record.delete)
        .fetch_one(&self.pool)
        .await?;
        Ok(saved)
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn create_user(&self, user: User) -> Result<User, LookupError> {
        let saved = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (id, name, email, role, api_key) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
        ))
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(user.role)
        .bind(&user.api_key)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| LookupError::from_insert(err, DUPLICATE_USER))?;
        Ok(saved)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, LookupError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// create_book
    ///
    /// Re-creating the ISBN of a soft-deleted book revives that row. A live book
    /// with the same ISBN is a `Conflict`, even when it was inserted after the
    /// handler's own existence check.
    async fn create_book(&self, req: CreateBookRequest) -> Result<Book, LookupError> {
        let book = sqlx::query_as::<_, Book>(&format!(
            "INSERT INTO books (isbn, author, title, genre, publish_date) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (isbn) DO UPDATE SET \
                 author = EXCLUDED.author, \
                 title = EXCLUDED.title, \
                 genre = EXCLUDED.genre, \
                 publish_date = EXCLUDED.publish_date, \
                 created_at = now(), \
                 updated_at = now(), \
                 deleted_at = NULL \
             WHERE books.deleted_at IS NOT NULL \
             RETURNING {BOOK_COLUMNS}"
        ))
        .bind(&req.isbn)
        .bind(&req.author)
        .bind(&req.title)
        .bind(&req.genre)
        .bind(req.publish_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| LookupError::from_insert(err, DUPLICATE_ISBN))?;
        // No row back means the conflicting book is live.
        book.ok_or_else(|| LookupError::Conflict(DUPLICATE_ISBN.to_string()))
    }

    async fn find_book(&self, isbn: &str) -> Result<Option<Book>, LookupError> {
        let book = sqlx::query_as::<_, Book>(&format!(
            "SELECT {BOOK_COLUMNS} FROM books WHERE isbn = $1 AND deleted_at IS NULL"
        ))
        .bind(isbn)
        .fetch_optional(&self.pool)
        .await?;
        Ok(book)
    }

    /// find_books
    ///
    /// Filters are pushed with `QueryBuilder::push_bind`, never interpolated.
    async fn find_books(
        &self,
        filter: &BookFilter,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Book>, i64), LookupError> {
        fn push_filters(builder: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &BookFilter) {
            if let Some(author) = &filter.author {
                builder.push(" AND author = ");
                builder.push_bind(author.clone());
            }
            if let Some(genre) = &filter.genre {
                builder.push(" AND genre = ");
                builder.push_bind(genre.clone());
            }
            if let Some(date) = filter.publish_date {
                builder.push(" AND publish_date = ");
                builder.push_bind(date);
            }
        }

        let mut count: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM books WHERE deleted_at IS NULL");
        push_filters(&mut count, filter);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut page: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "SELECT {BOOK_COLUMNS} FROM books WHERE deleted_at IS NULL"
        ));
        push_filters(&mut page, filter);
        page.push(" ORDER BY created_at, isbn LIMIT ");
        page.push_bind(limit);
        page.push(" OFFSET ");
        page.push_bind(offset);
        let books = page.build_query_as::<Book>().fetch_all(&self.pool).await?;

        Ok((books, total))
    }

    async fn update_book(
        &self,
        isbn: &str,
        req: UpdateBookRequest,
    ) -> Result<Option<Book>, LookupError> {
        let book = sqlx::query_as::<_, Book>(&format!(
            "UPDATE books SET \
                 author = COALESCE($2, author), \
                 title = COALESCE($3, title), \
                 genre = COALESCE($4, genre), \
                 publish_date = COALESCE($5, publish_date), \
                 updated_at = now() \
             WHERE isbn = $1 AND deleted_at IS NULL \
             RETURNING {BOOK_COLUMNS}"
        ))
        .bind(isbn)
        .bind(req.author)
        .bind(req.title)
        .bind(req.genre)
        .bind(req.publish_date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(book)
    }

    async fn soft_delete_book(&self, isbn: &str) -> Result<bool, LookupError> {
        let result = sqlx::query(
            "UPDATE books SET deleted_at = now() WHERE isbn = $1 AND deleted_at IS NULL",
        )
        .bind(isbn)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// InMemoryRepository
///
/// A process-local implementation of every persistence trait. Used by the test
/// suites and for running the router without Postgres.
#[derive(Default)]
pub struct InMemoryRepository {
    users: RwLock<Vec<User>>,
    permissions: RwLock<HashMap<(Role, String), PermissionRecord>>,
    books: RwLock<Vec<Book>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.users.get_mut().push(user);
        self
    }

    pub fn with_permission(mut self, record: PermissionRecord) -> Self {
        self.permissions
            .get_mut()
            .insert((record.role, record.entity.clone()), record);
        self
    }

    pub fn with_book(mut self, book: Book) -> Self {
        self.books.get_mut().push(book);
        self
    }
}

fn matches_filter(book: &Book, filter: &BookFilter) -> bool {
    filter.author.as_ref().is_none_or(|a| &book.author == a)
        && filter.genre.as_ref().is_none_or(|g| &book.genre == g)
        && filter.publish_date.is_none_or(|d| book.publish_date == d)
}

#[async_trait]
impl CallerDirectory for InMemoryRepository {
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<User>, LookupError> {
        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.api_key == api_key).cloned())
    }
}

#[async_trait]
impl PermissionLookup for InMemoryRepository {
    async fn find_permission(
        &self,
        role: Role,
        entity: &str,
    ) -> Result<Option<PermissionRecord>, LookupError> {
        let permissions = self.permissions.read().await;
        Ok(permissions.get(&(role, entity.to_string())).cloned())
    }
}

#[async_trait]
impl PermissionStore for InMemoryRepository {
    async fn list_permissions(&self) -> Result<Vec<PermissionRecord>, LookupError> {
        let permissions = self.permissions.read().await;
        let mut records: Vec<_> = permissions.values().cloned().collect();
        records.sort_by(|a, b| (&a.entity, a.role.as_str()).cmp(&(&b.entity, b.role.as_str())));
        Ok(records)
    }

    async fn upsert_permission(
        &self,
        record: PermissionRecord,
    ) -> Result<PermissionRecord, LookupError> {
        let mut permissions = self.permissions.write().await;
        permissions.insert((record.role, record.entity.clone()), record.clone());
        Ok(record)
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create_user(&self, user: User) -> Result<User, LookupError> {
        let mut users = self.users.write().await;
        if users
            .iter()
            .any(|u| u.email == user.email || u.api_key == user.api_key)
        {
            return Err(LookupError::Conflict(DUPLICATE_USER.to_string()));
        }
        users.push(user.clone());
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, LookupError> {
        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.email == email).cloned())
    }

    async fn create_book(&self, req: CreateBookRequest) -> Result<Book, LookupError> {
        let now = Utc::now();
        let book = Book {
            isbn: req.isbn,
            author: req.author,
            title: req.title,
            genre: req.genre,
            publish_date: req.publish_date,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let mut books = self.books.write().await;
        if books
            .iter()
            .any(|b| b.isbn == book.isbn && b.deleted_at.is_none())
        {
            return Err(LookupError::Conflict(DUPLICATE_ISBN.to_string()));
        }
        // A soft-deleted row with the same ISBN is replaced.
        books.retain(|b| b.isbn != book.isbn);
        books.push(book.clone());
        Ok(book)
    }

    async fn find_book(&self, isbn: &str) -> Result<Option<Book>, LookupError> {
        let books = self.books.read().await;
        Ok(books
            .iter()
            .find(|b| b.isbn == isbn && b.deleted_at.is_none())
            .cloned())
    }

    async fn find_books(
        &self,
        filter: &BookFilter,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Book>, i64), LookupError> {
        let books = self.books.read().await;
        let matching: Vec<&Book> = books
            .iter()
            .filter(|b| b.deleted_at.is_none() && matches_filter(b, filter))
            .collect();
        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn update_book(
        &self,
        isbn: &str,
        req: UpdateBookRequest,
    ) -> Result<Option<Book>, LookupError> {
        let mut books = self.books.write().await;
        let Some(book) = books
            .iter_mut()
            .find(|b| b.isbn == isbn && b.deleted_at.is_none())
        else {
            return Ok(None);
        };
        if let Some(author) = req.author {
            book.author = author;
        }
        if let Some(title) = req.title {
            book.title = title;
        }
        if let Some(genre) = req.genre {
            book.genre = genre;
        }
        if let Some(date) = req.publish_date {
            book.publish_date = date;
        }
        book.updated_at = Utc::now();
        Ok(Some(book.clone()))
    }

    async fn soft_delete_book(&self, isbn: &str) -> Result<bool, LookupError> {
        let mut books = self.books.write().await;
        match books
            .iter_mut()
            .find(|b| b.isbn == isbn && b.deleted_at.is_none())
        {
            Some(book) => {
                book.deleted_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

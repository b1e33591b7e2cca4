use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};
use uuid::Uuid;

use crate::{error::AuthError, models::Role, repository::CallerDirectory};

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// CallerIdentity
///
/// The principal resolved from a request's API key. The identity resolver stores it
/// in the request extensions; it lives exactly as long as the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Primary key of the user record in the Caller Directory.
    pub id: Uuid,
    /// The RBAC role used by the policy enforcer.
    pub role: Role,
    /// The raw credential the identity was resolved from.
    pub api_key: String,
}

/// extract_api_key
///
/// Reads `x-api-key`. A missing header, an empty value, or a value that is not
/// visible ASCII are all treated as no credential.
pub fn extract_api_key(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(AuthError::MissingCredential)
}

/// resolve_identity
///
/// The first stage of the access pipeline: header -> Caller Directory -> identity.
///
/// The directory is queried with the exact key. A directory failure is logged and
/// reported as `InvalidCredential`; it is never retried and never falls back to
/// an anonymous identity.
pub async fn resolve_identity<D>(
    headers: &HeaderMap,
    directory: &D,
) -> Result<CallerIdentity, AuthError>
where
    D: CallerDirectory + ?Sized,
{
    let api_key = match extract_api_key(headers) {
        Ok(key) => key,
        Err(err) => {
            tracing::warn!(reason = "missing_credential", "authentication rejected");
            return Err(err);
        }
    };

    let user = match directory.find_by_api_key(api_key).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::warn!(reason = "invalid_credential", "authentication rejected");
            return Err(AuthError::InvalidCredential);
        }
        Err(err) => {
            tracing::error!(error = %err, "caller directory lookup failed");
            return Err(AuthError::InvalidCredential);
        }
    };

    tracing::debug!(user_id = %user.id, role = %user.role, "caller identified");
    Ok(CallerIdentity {
        id: user.id,
        role: user.role,
        api_key: api_key.to_string(),
    })
}

/// CallerIdentity Extractor
///
/// Hands the identity attached by the access pipeline to a handler. It never
/// resolves anything itself: a handler mounted without the pipeline gets
/// `MissingIdentity` (500), because that is a wiring defect, not a caller error.
impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CallerIdentity>()
            .cloned()
            .ok_or(AuthError::MissingIdentity)
    }
}

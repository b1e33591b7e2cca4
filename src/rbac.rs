use axum::{
    extract::{FromRef, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    AppState,
    auth::{CallerIdentity, resolve_identity},
    error::AuthError,
    policy::{HandlerKey, PolicyRegistry, PolicyState},
    repository::{DirectoryState, PermissionLookup, PermissionState},
};

/// authorize
///
/// The policy enforcer. Checks run in a fixed order and the first failure wins:
///
/// 1. an identity must already be attached (`MissingIdentity`)
/// 2. the handler must have a declaration (`PolicyNotConfigured`)
/// 3. the caller's role must be allowed by it (`InsufficientRole`), checked before
///    any I/O so a rejected role never reaches the permission store
/// 4. a record must exist for (role, entity) (`PermissionNotConfigured`)
/// 5. the record's flag for the declared action must be set (`ActionDenied`)
///
/// Nothing is cached here; the outcome is a function of the identity, the
/// declaration, and the record read in step 4.
pub async fn authorize<L>(
    identity: Option<&CallerIdentity>,
    key: HandlerKey,
    policies: &PolicyRegistry,
    permissions: &L,
) -> Result<(), AuthError>
where
    L: PermissionLookup + ?Sized,
{
    let Some(identity) = identity else {
        tracing::error!(handler = %key, "policy enforcer invoked before identity resolution");
        return Err(AuthError::MissingIdentity);
    };

    let Some(policy) = policies.get(&key) else {
        tracing::error!(handler = %key, "no route policy registered");
        return Err(AuthError::PolicyNotConfigured(key));
    };

    if !policy.permits_role(identity.role) {
        tracing::warn!(
            handler = %key,
            role = %identity.role,
            reason = "insufficient_role",
            "authorization rejected"
        );
        return Err(AuthError::InsufficientRole {
            role: identity.role,
            action: policy.action,
            entity: policy.entity.clone(),
        });
    }

    let record = match permissions.find_permission(identity.role, &policy.entity).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            tracing::error!(
                role = %identity.role,
                entity = %policy.entity,
                "no permission record configured"
            );
            return Err(AuthError::PermissionNotConfigured {
                role: identity.role,
                entity: policy.entity.clone(),
            });
        }
        Err(err) => {
            tracing::error!(error = %err, entity = %policy.entity, "permission lookup failed");
            return Err(AuthError::PermissionNotConfigured {
                role: identity.role,
                entity: policy.entity.clone(),
            });
        }
    };

    if !record.allows(policy.action) {
        tracing::warn!(
            handler = %key,
            role = %identity.role,
            action = %policy.action,
            reason = "action_denied",
            "authorization rejected"
        );
        return Err(AuthError::ActionDenied {
            role: identity.role,
            action: policy.action,
            entity: policy.entity.clone(),
        });
    }

    Ok(())
}

/// AccessPipeline
///
/// The two guards composed in order: identity resolution, then policy enforcement.
/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct AccessPipeline {
    directory: DirectoryState,
    permissions: PermissionState,
    policies: PolicyState,
}

impl AccessPipeline {
    pub fn new(directory: DirectoryState, permissions: PermissionState, policies: PolicyState) -> Self {
        Self {
            directory,
            permissions,
            policies,
        }
    }

    /// check
    ///
    /// Runs both stages against `request`. On success the identity is left in the
    /// request extensions for the handler and also returned. The policy stage reads
    /// the identity back from the extensions, so it sees exactly what the handler
    /// will see.
    #[tracing::instrument(name = "access_check", skip_all, fields(handler = %key))]
    pub async fn check(
        &self,
        request: &mut Request,
        key: HandlerKey,
    ) -> Result<CallerIdentity, AuthError> {
        let identity = resolve_identity(request.headers(), &*self.directory).await?;
        request.extensions_mut().insert(identity);

        let attached = request.extensions().get::<CallerIdentity>().cloned();
        authorize(attached.as_ref(), key, &self.policies, &*self.permissions).await?;

        attached.ok_or(AuthError::MissingIdentity)
    }
}

impl FromRef<AppState> for AccessPipeline {
    fn from_ref(state: &AppState) -> AccessPipeline {
        AccessPipeline::new(
            state.directory.clone(),
            state.permissions.clone(),
            state.policies.clone(),
        )
    }
}

/// RouteGuard
///
/// Middleware state for one protected route: the shared pipeline plus the key of
/// the handler it fronts.
#[derive(Clone)]
pub struct RouteGuard {
    pub pipeline: AccessPipeline,
    pub key: HandlerKey,
}

/// guard_route
///
/// Middleware running the access pipeline before a protected handler. A rejection
/// short-circuits into the error response; the handler is never called.
pub async fn guard_route(
    State(guard): State<RouteGuard>,
    mut request: Request,
    next: Next,
) -> Response {
    match guard.pipeline.check(&mut request, guard.key).await {
        Ok(_) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}

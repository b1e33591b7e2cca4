use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use thiserror::Error;

use crate::models::{Action, Role};

/// HandlerKey
///
/// Stable identity of a protected handler. Routes carry their key into the access
/// pipeline, which uses it to find the handler's `RoutePolicy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey(&'static str);

impl HandlerKey {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// RoutePolicy
///
/// The access rule declared for one handler: who may reach it, and which action it
/// performs on which entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    pub allowed_roles: HashSet<Role>,
    pub action: Action,
    pub entity: String,
}

impl RoutePolicy {
    pub fn permits_role(&self, role: Role) -> bool {
        self.allowed_roles.contains(&role)
    }
}

/// rbac
///
/// Shorthand for declaring a `RoutePolicy` next to a route registration.
pub fn rbac(roles: &[Role], action: Action, entity: &str) -> RoutePolicy {
    RoutePolicy {
        allowed_roles: roles.iter().copied().collect(),
        action,
        entity: entity.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("handler {0} already has a route policy")]
    Duplicate(HandlerKey),

    #[error("route policy for handler {0} allows no roles")]
    NoRoles(HandlerKey),

    #[error("route policy for handler {0} has an empty entity")]
    EmptyEntity(HandlerKey),
}

/// PolicyRegistry
///
/// The startup-built table of route policies. Immutable once built and shared as
/// `PolicyState` across request tasks.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: HashMap<HandlerKey, RoutePolicy>,
}

impl PolicyRegistry {
    pub fn builder() -> PolicyRegistryBuilder {
        PolicyRegistryBuilder::default()
    }

    pub fn get(&self, key: &HandlerKey) -> Option<&RoutePolicy> {
        self.policies.get(key)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Iterates the declarations, for inspection and startup logging.
    pub fn iter(&self) -> impl Iterator<Item = (&HandlerKey, &RoutePolicy)> {
        self.policies.iter()
    }
}

/// Collects registrations and rejects malformed or duplicate declarations before
/// the server starts serving.
#[derive(Debug, Default)]
pub struct PolicyRegistryBuilder {
    policies: HashMap<HandlerKey, RoutePolicy>,
    errors: Vec<PolicyError>,
}

impl PolicyRegistryBuilder {
    pub fn register(mut self, key: HandlerKey, policy: RoutePolicy) -> Self {
        if policy.allowed_roles.is_empty() {
            self.errors.push(PolicyError::NoRoles(key));
        } else if policy.entity.trim().is_empty() {
            self.errors.push(PolicyError::EmptyEntity(key));
        } else if self.policies.insert(key, policy).is_some() {
            self.errors.push(PolicyError::Duplicate(key));
        }
        self
    }

    /// Returns the first registration error, if any.
    pub fn build(self) -> Result<PolicyRegistry, PolicyError> {
        match self.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(PolicyRegistry {
                policies: self.policies,
            }),
        }
    }
}

pub type PolicyState = Arc<PolicyRegistry>;

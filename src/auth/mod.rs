pub mod permissions;
pub mod rbac;

pub use permissions::{ClusterId, PermissionTable, Screen, Verb, VerbSet};
pub use rbac::{Authorizer, OverrideGrant};

use crate::errors::ServiceError;
use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
pub const ACTOR_CLUSTER_HEADER: &str = "x-actor-cluster";

/// Acting identity supplied by the session provider. The engine only
/// authorizes; it never authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub actor_id: String,
    pub role: String,
    pub cluster: ClusterId,
}

impl ActorContext {
    pub fn new(actor_id: impl Into<String>, role: impl Into<String>, cluster: ClusterId) -> Self {
        Self {
            actor_id: actor_id.into(),
            role: role.into(),
            cluster,
        }
    }
}

/// Raw identity headers; cluster resolution happens against the permission
/// table in the handler state.
#[derive(Debug, Clone)]
pub struct ActorHeaders {
    pub actor_id: String,
    pub role: String,
    pub cluster: Option<String>,
}

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl<S> FromRequestParts<S> for ActorHeaders
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor_id = header(parts, ACTOR_ID_HEADER)
            .ok_or_else(|| ServiceError::Unauthorized(format!("missing {}", ACTOR_ID_HEADER)))?;
        let role = header(parts, ACTOR_ROLE_HEADER)
            .ok_or_else(|| ServiceError::Unauthorized(format!("missing {}", ACTOR_ROLE_HEADER)))?;

        Ok(ActorHeaders {
            actor_id,
            role,
            cluster: header(parts, ACTOR_CLUSTER_HEADER),
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
    Arc<Authorizer>: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let headers = ActorHeaders::from_request_parts(parts, state).await?;
        let authorizer = Arc::<Authorizer>::from_ref(state);
        authorizer.resolve_actor(headers.actor_id, headers.role, headers.cluster.as_deref())
    }
}

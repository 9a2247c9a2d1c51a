use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use consultbook_common::{AppError, UserRole};

use crate::jwt::{Claims, JwtService};

/// Caller identity taken from a bearer token. Handlers that take this
/// extractor reject unauthenticated requests with 401.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: String,
    pub roles: Vec<UserRole>,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.roles.contains(&UserRole::Admin)
    }
}

impl TryFrom<Claims> for AuthenticatedUser {
    type Error = AppError;

    fn try_from(claims: Claims) -> Result<Self, Self::Error> {
        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|e| AppError::Authentication(format!("Invalid user ID in token: {}", e)))?;
        Ok(Self {
            user_id,
            email: claims.email,
            roles: claims.roles,
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    JwtService: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = extract_token_from_headers(&parts.headers)
            .ok_or_else(|| AppError::Authentication("Missing bearer token".to_string()))?;

        let jwt_service = JwtService::from_ref(state);
        let claims = jwt_service.validate_token(token).map_err(|e| {
            tracing::warn!(target: "security", error = %e, "Rejected bearer token");
            e
        })?;
        claims.try_into()
    }
}

/// Extract JWT token from Authorization header
fn extract_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let auth_str = headers.get(AUTHORIZATION)?.to_str().ok()?;
    auth_str.strip_prefix("Bearer ")
}

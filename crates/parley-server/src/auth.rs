//! Caller identity.
//!
//! Session and password handling live in an external authentication layer
//! that forwards the authenticated account id in the `x-user-id` header.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use parley_shared::types::UserId;

use crate::error::ServerError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The caller's account id, rejected with 401 when absent or blank.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub UserId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ServerError::Unauthorized)?;

        UserId::parse(raw)
            .map(AuthenticatedUser)
            .map_err(|_| ServerError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(req: Request<()>) -> Result<AuthenticatedUser, ServerError> {
        let (mut parts, _) = req.into_parts();
        AuthenticatedUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_header_is_required() {
        let req = Request::builder().body(()).unwrap();
        assert!(matches!(extract(req).await, Err(ServerError::Unauthorized)));

        let req = Request::builder()
            .header(USER_ID_HEADER, "  ")
            .body(())
            .unwrap();
        assert!(matches!(extract(req).await, Err(ServerError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_header_is_trimmed() {
        let req = Request::builder()
            .header(USER_ID_HEADER, " 64f1a0 ")
            .body(())
            .unwrap();
        let AuthenticatedUser(user) = extract(req).await.unwrap();
        assert_eq!(user.as_str(), "64f1a0");
    }
}

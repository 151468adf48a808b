//! Request authentication.
//!
//! Two layers: a pre-shared key gate in front of the whole API, compared in
//! constant time, and the acting user identity every handler receives
//! explicitly through [`ActingUser`].

use axum::{
    extract::{FromRequestParts, Request},
    http::{header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::errors::AppError;

/// Header name for the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header carrying the identity of the acting user.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Longest user id accepted from the header.
const MAX_USER_ID_LEN: usize = 128;

/// PSK authentication layer function that takes the expected PSK as a parameter.
pub async fn psk_auth_layer(
    expected_psk: Option<String>,
    request: Request,
    next: Next,
) -> Response {
    // If no PSK is configured, allow all requests (dev mode)
    let Some(expected) = expected_psk else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
        });

    let rejection = match provided {
        Some(key) if constant_time_compare(key, &expected) => None,
        Some(_) => Some("Invalid API key"),
        None => Some("Missing API key"),
    };

    match rejection {
        None => next.run(request).await,
        Some(message) => AppError::Unauthorized(message.to_string()).into_response(),
    }
}

/// Perform constant-time string comparison.
fn constant_time_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// The user on whose behalf a request acts.
///
/// Resolved from the `x-user-id` header; identity verification happens
/// upstream of this service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActingUser(pub String);

impl ActingUser {
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for ActingUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthorized(format!("Missing {} header", USER_ID_HEADER)))?
            .to_str()
            .map_err(|_| AppError::Unauthorized(format!("Malformed {} header", USER_ID_HEADER)))?
            .trim();

        if raw.is_empty() || raw.len() > MAX_USER_ID_LEN {
            return Err(AppError::Unauthorized(format!(
                "Malformed {} header",
                USER_ID_HEADER
            )));
        }

        Ok(ActingUser(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    #[test]
    fn test_constant_time_compare_equal() {
        assert!(constant_time_compare("test-key-123", "test-key-123"));
    }

    #[test]
    fn test_constant_time_compare_not_equal() {
        assert!(!constant_time_compare("test-key-123", "test-key-124"));
    }

    #[test]
    fn test_constant_time_compare_different_lengths() {
        assert!(!constant_time_compare("short", "much-longer-key"));
    }

    #[test]
    fn test_constant_time_compare_empty() {
        assert!(constant_time_compare("", ""));
        assert!(!constant_time_compare("", "not-empty"));
    }

    fn app(psk: Option<&str>) -> Router {
        let psk = psk.map(str::to_string);
        Router::new()
            .route("/whoami", get(|user: ActingUser| async move { user.0 }))
            .layer(middleware::from_fn(move |req, next| {
                psk_auth_layer(psk.clone(), req, next)
            }))
    }

    fn request(headers: &[(&str, &str)]) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri("/whoami");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_psk_gate() {
        let resp = app(Some("secret"))
            .oneshot(request(&[(USER_ID_HEADER, "u1")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app(Some("secret"))
            .oneshot(request(&[(API_KEY_HEADER, "wrong"), (USER_ID_HEADER, "u1")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app(Some("secret"))
            .oneshot(request(&[
                ("authorization", "Bearer secret"),
                (USER_ID_HEADER, "u1"),
            ]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_acting_user_required() {
        let resp = app(None).oneshot(request(&[])).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app(None)
            .oneshot(request(&[(USER_ID_HEADER, "   ")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app(None)
            .oneshot(request(&[(USER_ID_HEADER, "organizer-1")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"organizer-1");
    }
}

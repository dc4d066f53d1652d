use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::events::{REASON_INVALID_TOKEN, REASON_NO_TOKEN};

/// Claims carried by a session token. The issuing auth server is external;
/// we only validate the signature and expiry and read the user id.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub exp: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no token provided")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

impl AuthError {
    /// The protocol-visible close reason for this failure.
    pub fn close_reason(&self) -> &'static str {
        match self {
            AuthError::MissingToken => REASON_NO_TOKEN,
            AuthError::InvalidToken(_) => REASON_INVALID_TOKEN,
        }
    }
}

/// Validate a bearer token and return its claims.
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims)
}

/// Extract the bearer token from a connection request.
///
/// Precedence: `Authorization: Bearer` header, then the `token` query
/// parameter, then the `token` cookie.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    let cookies = headers.get(COOKIE).and_then(|v| v.to_str().ok())?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "token" && !value.is_empty()).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn make_token(user_id: &str, secret: &str, exp: usize) -> String {
        let claims = Claims {
            user_id: user_id.to_string(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> usize {
        (crate::events::now_ms() / 1000 + 3600) as usize
    }

    #[test]
    fn test_validate_token_round_trip() {
        let token = make_token("u1", "s3cret", far_future());
        let claims = validate_token(&token, "s3cret").unwrap();
        assert_eq!(claims.user_id, "u1");
    }

    #[test]
    fn test_validate_token_wrong_secret() {
        let token = make_token("u1", "s3cret", far_future());
        let err = validate_token(&token, "other").unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
        assert_eq!(err.close_reason(), REASON_INVALID_TOKEN);
    }

    #[test]
    fn test_validate_token_expired() {
        let token = make_token("u1", "s3cret", 1_000_000);
        assert!(validate_token(&token, "s3cret").is_err());
    }

    #[test]
    fn test_validate_token_garbage() {
        assert!(validate_token("not-a-jwt", "s3cret").is_err());
    }

    #[test]
    fn test_missing_token_reason() {
        assert_eq!(AuthError::MissingToken.close_reason(), REASON_NO_TOKEN);
    }

    #[test]
    fn test_extract_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        headers.insert(COOKIE, HeaderValue::from_static("token=from-cookie"));

        let token = extract_token(&headers, Some("from-query"));
        assert_eq!(token.as_deref(), Some("from-header"));
    }

    #[test]
    fn test_extract_falls_back_to_query() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("token=from-cookie"));

        let token = extract_token(&headers, Some("from-query"));
        assert_eq!(token.as_deref(), Some("from-query"));
    }

    #[test]
    fn test_extract_falls_back_to_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("other=1; token=from-cookie; theme=dark"),
        );

        let token = extract_token(&headers, None);
        assert_eq!(token.as_deref(), Some("from-cookie"));
    }

    #[test]
    fn test_extract_none_when_absent() {
        let headers = HeaderMap::new();
        assert!(extract_token(&headers, None).is_none());
    }

    #[test]
    fn test_extract_ignores_non_bearer_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwdw=="));

        assert!(extract_token(&headers, None).is_none());
    }
}

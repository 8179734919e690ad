//! Cookie-based user identification.
//!
//! There is no authentication: `/signin` simply sets a `user_id` cookie and
//! every other route trusts it.

use axum::http::{HeaderMap, HeaderValue, header};

use crate::error::ApiError;

pub const USER_COOKIE: &str = "user_id";

/// One year
const COOKIE_MAX_AGE_SECS: u64 = 365 * 24 * 60 * 60;

/// The caller, as identified by the `user_id` cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub i64);

impl CurrentUser {
    pub fn id(self) -> i64 {
        self.0
    }
}

/// Find the `user_id` cookie and parse it. `Ok(None)` when absent.
pub fn user_id_from_headers(headers: &HeaderMap) -> Result<Option<i64>, ApiError> {
    let raw = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == USER_COOKIE)
        .map(|(_, value)| value.trim());

    match raw {
        None => Ok(None),
        Some(value) => match value.parse::<i64>() {
            Ok(id) if id > 0 => Ok(Some(id)),
            _ => Err(ApiError::InvalidIdentity),
        },
    }
}

/// `Set-Cookie` value identifying `user_id`.
pub fn user_cookie(user_id: i64) -> HeaderValue {
    let cookie = format!(
        "{USER_COOKIE}={user_id}; Path=/; HttpOnly; SameSite=Lax; Max-Age={COOKIE_MAX_AGE_SECS}"
    );
    // Only digits and fixed ASCII
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static("user_id=; Path=/"))
}

/// Extract CurrentUser from the cookie. 401 if missing, 400 if malformed.
impl<S> axum::extract::FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        user_id_from_headers(&parts.headers)?
            .map(CurrentUser)
            .ok_or(ApiError::MissingIdentity)
    }
}

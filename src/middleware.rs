use std::sync::Arc;

use axum::{
    extract::{Query, Request},
    http::header,
    middleware::Next,
    response::IntoResponse,
    Extension,
};

use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ErrorMessage, HttpError},
    utils::token,
    AppState,
};

/// Account identity carried by the session token. Accounts themselves are
/// owned by the external auth service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuthAccount {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JWTAuthMiddeware {
    pub account: AuthAccount,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub async fn auth(
    cookie_jar: CookieJar,
    Extension(app_state): Extension<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, HttpError> {
    let token = cookie_jar
        .get("token")
        .map(|cookie| cookie.value().to_string())
        .or_else(|| {
            req.headers()
                .get(header::AUTHORIZATION)
                .and_then(|auth_header| auth_header.to_str().ok())
                .and_then(|auth_value| auth_value.strip_prefix("Bearer "))
                .map(|token| token.to_owned())
        })
        // Browsers cannot set headers on a websocket upgrade.
        .or_else(|| {
            Query::<TokenQuery>::try_from_uri(req.uri())
                .ok()
                .and_then(|Query(query)| query.token)
        });

    let token = token.ok_or_else(|| {
        HttpError::unauthorized(ErrorMessage::TokenNotProvided.to_string())
    })?;

    let claims = token::decode_token(token, app_state.env.jwt_secret.as_bytes())?;

    let account_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| HttpError::unauthorized(ErrorMessage::InvalidToken.to_string()))?;

    req.extensions_mut().insert(JWTAuthMiddeware {
        account: AuthAccount {
            id: account_id,
            name: claims.name,
        },
    });

    Ok(next.run(req).await)
}

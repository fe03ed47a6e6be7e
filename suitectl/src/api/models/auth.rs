//! Session payloads. Responses that change the session carry a `Set-Cookie` header.

use crate::api::models::users::UserResponse;
use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthResponse {
    pub user: UserResponse,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthSuccessResponse {
    pub message: String,
}

/// Body plus the cookie to set alongside it.
pub struct WithCookie<T> {
    pub body: T,
    pub cookie: String,
    pub status: StatusCode,
}

impl<T> WithCookie<T> {
    pub fn new(body: T, cookie: String) -> Self {
        Self {
            body,
            cookie,
            status: StatusCode::OK,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl<T: Serialize> IntoResponse for WithCookie<T> {
    fn into_response(self) -> Response {
        (self.status, [(header::SET_COOKIE, self.cookie)], Json(self.body)).into_response()
    }
}

pub type SessionResponse = WithCookie<AuthResponse>;
pub type LogoutResponse = WithCookie<AuthSuccessResponse>;

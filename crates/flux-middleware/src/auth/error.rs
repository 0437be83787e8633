use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// 认证 / 授权错误
///
/// 缺少或无效的令牌返回 403，令牌有效但缺少角色返回 401。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token lacks required role '{0}'")]
    MissingRole(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken(_) => StatusCode::FORBIDDEN,
            AuthError::MissingRole(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AuthError::MissingToken.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AuthError::InvalidToken("bad signature".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AuthError::MissingRole("tracker".into()).status(),
            StatusCode::UNAUTHORIZED
        );
    }
}

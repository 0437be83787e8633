use axum::{
    extract::{Query, Request, State},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{AuthError, JwtAuth};

/// 从 `Authorization: Bearer <token>` 或 `?Bearer=<token>` 中取令牌
pub fn extract_token(req: &Request) -> Option<String> {
    let from_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());

    if from_header.is_some() {
        return from_header;
    }

    Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(mut params)| params.remove("Bearer"))
}

/// Bearer 认证中间件
pub async fn bearer_auth(
    State(jwt_auth): State<Arc<JwtAuth>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = extract_token(&req).ok_or(AuthError::MissingToken)?;

    let claims = jwt_auth.authorize(&token).map_err(|e| {
        debug!("Rejected request to {}: {}", req.uri().path(), e);
        e
    })?;

    // 将 claims 注入到 request extensions
    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Claims;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
        Extension, Router,
    };
    use tower::ServiceExt;

    fn app(auth: Arc<JwtAuth>) -> Router {
        Router::new()
            .route(
                "/objectIds",
                get(|Extension(claims): Extension<Claims>| async move { claims.sub }),
            )
            .layer(middleware::from_fn_with_state(auth, bearer_auth))
    }

    fn auth() -> Arc<JwtAuth> {
        Arc::new(JwtAuth::new("test-secret", "flux-reid", "tracker"))
    }

    async fn status_of(auth: Arc<JwtAuth>, req: HttpRequest<Body>) -> StatusCode {
        app(auth).oneshot(req).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_no_token_is_forbidden() {
        let req = HttpRequest::builder()
            .uri("/objectIds")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(auth(), req).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_header_token_accepted() {
        let auth = auth();
        let token = auth.generate_token("ui", vec!["tracker".into()]).unwrap();
        let req = HttpRequest::builder()
            .uri("/objectIds")
            .header("Authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(auth, req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_query_token_accepted() {
        let auth = auth();
        let token = auth.generate_token("ui", vec!["tracker".into()]).unwrap();
        let req = HttpRequest::builder()
            .uri(format!("/objectIds?Bearer={}", token))
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(auth, req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_garbage_token_is_forbidden() {
        let req = HttpRequest::builder()
            .uri("/objectIds")
            .header("Authorization", "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(auth(), req).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_missing_role_is_unauthorized() {
        let auth = auth();
        let token = auth.generate_token("ui", vec!["viewer".into()]).unwrap();
        let req = HttpRequest::builder()
            .uri("/objectIds")
            .header("Authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(auth, req).await, StatusCode::UNAUTHORIZED);
    }
}

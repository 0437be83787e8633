use anyhow::Result;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::AuthError;

/// JWT 认证管理器
///
/// HS256 签名，校验 `aud` 与 `exp`，并要求 `roles` 中包含指定角色。
#[derive(Clone)]
pub struct JwtAuth {
    secret: Arc<String>,
    audience: String,
    required_role: String,
    expiration: Duration,
}

/// JWT Claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,           // 主体
    pub aud: String,           // 受众
    #[serde(default)]
    pub roles: Vec<String>,    // 角色
    pub exp: i64,              // 过期时间
    pub iat: i64,              // 签发时间
    pub jti: String,           // JWT ID
}

impl JwtAuth {
    pub fn new(
        secret: impl Into<String>,
        audience: impl Into<String>,
        required_role: impl Into<String>,
    ) -> Self {
        Self {
            secret: Arc::new(secret.into()),
            audience: audience.into(),
            required_role: required_role.into(),
            expiration: Duration::hours(24),
        }
    }

    /// 默认签发有效期
    pub fn with_expiration_hours(mut self, hours: i64) -> Self {
        self.expiration = Duration::hours(hours);
        self
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn required_role(&self) -> &str {
        &self.required_role
    }

    /// 按默认有效期签发
    pub fn generate_token(&self, subject: &str, roles: Vec<String>) -> Result<String> {
        self.issue(subject, roles, self.expiration)
    }

    /// 签发指定有效期的令牌
    pub fn issue(&self, subject: &str, roles: Vec<String>, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            aud: self.audience.clone(),
            roles,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;

        Ok(token)
    }

    /// 验证签名、受众和过期时间
    pub fn verify_token(&self, token: &str) -> std::result::Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[self.audience.as_str()]);
        validation.leeway = 0;

        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        Ok(token_data.claims)
    }

    /// 验证令牌并检查角色
    pub fn authorize(&self, token: &str) -> std::result::Result<Claims, AuthError> {
        let claims = self.verify_token(token)?;
        if !claims.roles.iter().any(|r| r == &self.required_role) {
            return Err(AuthError::MissingRole(self.required_role.clone()));
        }
        Ok(claims)
    }
}

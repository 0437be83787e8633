pub mod auth;

pub use auth::{bearer_auth, extract_token, AuthError, Claims, JwtAuth};

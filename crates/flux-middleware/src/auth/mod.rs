pub mod error;
pub mod jwt;
pub mod middleware;

pub use error::AuthError;
pub use jwt::{Claims, JwtAuth};
pub use middleware::{bearer_auth, extract_token};

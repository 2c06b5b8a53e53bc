//! Connection authentication.

mod middleware;

pub use middleware::{authorize, AuthUser, Role};

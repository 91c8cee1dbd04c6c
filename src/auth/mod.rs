//! Authentication primitives: password hashing and policy, session cache

pub mod password;
pub mod session_cache;

pub use password::{PasswordHasher, PasswordPolicy};
pub use session_cache::{CachedSession, InMemorySessionCache, SessionCache};

mod engine;
mod error;
mod member;
mod pool;

pub use engine::ProxyEngine;
pub use error::ProxyError;
pub use member::PoolMember;
pub use pool::{PoolConnectionError, RoundRobinPool};

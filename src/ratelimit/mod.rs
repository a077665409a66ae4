//! Rate limiting logic and storage backends.

mod backend;
mod clock;
mod connection;
mod counter;
mod key;
mod limiter;
mod mongo_backend;
mod record;
mod redis_backend;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{build_backend, StorageBackend};
pub use clock::{Clock, SystemClock};
pub use connection::{ConnectionState, ConnectionStatus, LazyConnection};
pub use counter::WindowCounter;
pub use key::{ClientRequest, KeyGenerator, UNKNOWN_CLIENT};
pub use limiter::{CheckOutcome, RateLimiter, Rejection, RejectionBody};
pub use mongo_backend::{MongoBackend, DEFAULT_DATABASE};
pub use record::{RateLimitDecision, RateLimitRecord};
pub use redis_backend::RedisBackend;

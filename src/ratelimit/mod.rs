//! Rate limiting logic and state management.

mod backend;
pub mod clock;
mod counter;
mod identity;
mod limiter;
mod rules;
pub mod storage;

pub use backend::RateLimitBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{ClientRateLimitState, RateLimitResult};
pub use identity::{identify_client, AuthenticatedPrincipal, ClientIdentity, IpWhitelist, RequestMeta};
pub use limiter::RateLimitService;
pub use rules::{RateLimitRule, RuleConfig, RuleSet};
pub use storage::{InMemoryStorage, RateLimitStorage, RedisStorage};

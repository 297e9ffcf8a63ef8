pub mod breaker;
pub mod dispatcher;
pub mod error;
pub mod filters;
pub mod rate_limit;
pub mod registry;
pub mod router;

pub use breaker::{BreakerMap, Outcome};
pub use dispatcher::GatewayDispatcher;
pub use error::{DispatchError, DispatchResult};
pub use rate_limit::RateLimiterMap;
pub use registry::{HealthState, UpstreamRegistry};
pub use router::{RouteTable, RouterHandle};

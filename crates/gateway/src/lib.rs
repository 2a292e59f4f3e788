//! Upstream clinical data access: the tool transport, the shared rate-limited
//! executor, pagination, record normalization and per-run memoization.

pub mod clinical;
pub mod normalize;
pub mod pagination;
pub mod rate_limit;
pub mod run_cache;
pub mod transport;

pub use clinical::{ClinicalTools, Paging};
pub use rate_limit::{ExecutorConfig, RateLimitedExecutor, UpstreamFailure};
pub use run_cache::RunCache;
pub use transport::{
    HttpToolConnector, ToolCallResult, ToolConnector, ToolError, ToolSession, ToolTransport,
};

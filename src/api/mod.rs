pub mod response;
pub mod routes;
pub mod ws;

pub use response::{ApiFailure, ApiResponse, ApiResult};
pub use routes::{router, RequestContext, Role, SyncEnvelope};

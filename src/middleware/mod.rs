//! HTTP middleware. Authentication and rate limiting live in external
//! collaborators; only request logging is part of the core.

pub mod logging;

pub use logging::request_logging;

//! HTTP gate: the middleware, its responses and a hosting server.

mod middleware;
pub mod response;
mod server;

pub use middleware::{enforce, Gate, Verdict};
pub use response::{Quota, RejectionBody};
pub use server::{build_router, GateServer};

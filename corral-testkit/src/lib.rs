//! Test doubles and fixtures shared by corral's integration tests and
//! benchmarks.

pub mod fixtures;
pub mod handlers;
pub mod store;

pub use fixtures::*;
pub use handlers::*;
pub use store::*;

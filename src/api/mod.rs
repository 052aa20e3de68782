//! HTTP surface: a thin authenticating bridge over the service.

pub mod handlers;
pub mod server;
pub mod types;

pub use server::{build_router, Server};

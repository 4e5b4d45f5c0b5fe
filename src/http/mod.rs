//! Request/response values and the network the agent fetches through.

mod client;
mod types;

pub use client::{HttpNetwork, Network};
pub use types::{cache_key, Request, Response};

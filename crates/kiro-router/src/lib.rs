//! Request Front-End (spec §4.J): the two inbound dialects' HTTP handlers.
//! Grounded on `gproxy-router::proxy::proxy_router`'s axum `Router` shape,
//! narrowed to exactly the four routes spec.md §6 names — no provider path
//! prefix, no Gemini, no OAuth/admin surface (the OAuth loopback listener
//! is wired separately, in the gateway binary).

mod error;
mod proxy;

pub use proxy::{RouterState, build_router};

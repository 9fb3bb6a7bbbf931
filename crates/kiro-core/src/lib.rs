pub mod bootstrap;
mod credential_refresher;
pub mod error;
pub mod proxy_engine;
pub mod scheduler;
pub mod state;

pub use bootstrap::{Bootstrap, CliArgs, bootstrap_from_env};
pub use error::GatewayError;
pub use proxy_engine::{EngineResult, ProxyEngine};
pub use state::AppState;

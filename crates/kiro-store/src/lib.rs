pub mod db;
pub mod entities;
pub mod snapshot;
pub mod store;

pub use snapshot::{GlobalConfigRow, StorageSnapshot};
pub use store::{NewUpstreamInput, Store, API_KEY_PREFIX};

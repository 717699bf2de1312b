mod series;
mod store;

pub use series::Series;
pub use store::{LocalStore, StoreError, DEFAULT_MAINTENANCE_INTERVAL, DEFAULT_REQUIREMENTS};

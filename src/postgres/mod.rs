pub mod connection;
pub mod store;
pub mod types;

pub use connection::{connect, create_pool, ping};
pub use store::{PostgresStore, StoreGateway, StoreQueries};
pub use types::*;

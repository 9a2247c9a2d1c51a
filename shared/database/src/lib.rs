pub mod models;
pub mod connection;
pub mod migrations;
pub mod store;
pub mod postgres;
pub mod memory;

pub use models::*;
pub use connection::*;
pub use migrations::*;
pub use store::*;
pub use postgres::PgBookingStore;
pub use memory::MemoryStore;

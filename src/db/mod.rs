//! Database module

pub mod connection;
pub mod meta;
pub mod repositories;
pub mod schema;

pub use connection::Database;
pub use repositories::checkpoint::CheckpointRepository;
pub use repositories::task::TaskRepository;

//! SQLite persistence for hunting tasks, certificate observations and the
//! hunting task list cache.

mod open;
mod models;
mod insert;
mod query;
mod cache;
mod schema;

pub use open::Db;
pub use models::*;
pub use insert::*;
pub use query::*;
pub use cache::SqliteCacheTx;

pub mod config;
pub mod crypto;
pub mod cycle;
pub mod db;
pub mod keys;
pub mod op;
pub mod refresh;
pub mod store;
pub mod sync;

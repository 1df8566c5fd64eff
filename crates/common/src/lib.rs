pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod redis_pool;
pub mod types;

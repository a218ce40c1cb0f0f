pub mod config;
pub mod db;
pub mod log;
pub mod logging;
pub mod repositories;

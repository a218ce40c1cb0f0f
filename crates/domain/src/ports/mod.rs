use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod counter;
pub mod cursor;
pub mod db;
pub mod log;
pub mod migration;
pub mod store;

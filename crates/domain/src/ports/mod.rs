use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod auth;
pub mod cipher;
pub mod jobs;
pub mod journal;
pub mod kv;

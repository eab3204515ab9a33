pub mod auth;
pub mod cipher;
pub mod config;
pub mod jobs;
pub mod kv;
pub mod logging;
pub mod repositories;

pub mod config;
pub mod db;
pub mod emitter;
pub mod error;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod presence;
pub mod queue;
pub mod services;

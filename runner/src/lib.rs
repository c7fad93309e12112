pub mod batch;
pub mod cache;
pub mod config;
pub mod models;
pub mod store;
pub mod submit;
pub mod working_dirs;

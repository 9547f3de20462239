pub mod completion;
pub mod config;
pub mod detector;
pub mod fetch;
pub mod models;
pub mod normalizer;
pub mod publisher;
pub mod schedule;
pub mod service;
pub mod store;
pub mod timeutil;

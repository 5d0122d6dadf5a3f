pub mod api;
pub mod auth;
pub mod config;
pub mod feed;
pub mod ingest;
pub mod merge;
pub mod models;
pub mod rangestore;
pub mod scheduler;
pub mod storage;

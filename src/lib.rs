pub mod aggregator;
pub mod client;
pub mod constants;
pub mod db;
pub mod hardening;
pub mod health;
pub mod ingress;
pub mod logging;
pub mod main_helper;
pub mod parser;
pub mod provider;
pub mod reconciler;
pub mod redaction_layer;
pub mod registry;
pub mod server;
pub mod store;
pub mod str_utils;
pub mod tag_extract;
pub mod types;
pub mod uploader;
pub mod upstream;
pub mod wire;

pub use types::*;

pub use main_helper::{AppState, Args};

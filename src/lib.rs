#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod cache;
pub mod client;
pub mod constants;
pub mod controller;
pub mod db;
pub mod eligibility;
pub mod events;
pub mod line_mapper;
pub mod logging;
pub mod main_helper;
pub mod models;
pub mod reconcile;
pub mod redaction_layer;
pub mod settings;
pub mod specs;
pub mod str_utils;
pub mod streaming;
pub mod types;

pub use types::*;
pub use main_helper::Args;

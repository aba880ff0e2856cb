pub mod api;
pub mod config;
pub mod db;
pub mod decompose;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod orchestrator;
pub mod render;

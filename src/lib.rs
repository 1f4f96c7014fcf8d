pub mod app;
pub mod cli;
pub mod command;
pub mod config;
pub mod dmon;
pub mod error;
pub mod history;
pub mod host;
pub mod identity;
pub mod logger;
pub mod models;
pub mod monitor;
pub mod nvidia;
pub mod processes;
pub mod store;
pub mod theme;
pub mod ui;

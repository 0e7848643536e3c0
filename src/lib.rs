pub mod bluetooth;
pub mod config;
pub mod core;
pub mod error;
pub mod input;
pub mod keymap;
pub mod logging;
pub mod output;
pub mod report;

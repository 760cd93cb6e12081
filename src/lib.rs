pub mod cli;
pub mod config;
pub mod logging;
pub mod offsets;
pub mod state;
pub mod utils;
pub mod web;

pub mod adb;
pub mod analysis;
pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod perfetto;
pub mod registry;
#[cfg(test)]
pub mod testing;

pub mod channel;
pub mod parse;
pub mod paths;
pub mod runner;

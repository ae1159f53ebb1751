pub mod controller;
pub mod filename;
pub mod probe;

pub mod graph;
pub mod interpreter;
pub mod services;
pub mod simulator;
pub mod utils;

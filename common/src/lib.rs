// Core library for the program trigger scheduler

pub mod config;
pub mod constraint;
pub mod db;
pub mod errors;
pub mod models;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod trigger;

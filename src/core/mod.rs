// Core scheduling logic

pub mod scheduler;

pub use scheduler::*;

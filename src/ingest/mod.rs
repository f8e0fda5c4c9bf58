pub mod hasher;
pub mod orchestrator;
pub mod parameters;
pub mod record;
pub mod scanner;

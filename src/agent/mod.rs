pub mod memory;
pub mod orchestrator;
pub mod security;
pub mod session;
pub mod sql_scan;
pub mod state;
pub mod validation;

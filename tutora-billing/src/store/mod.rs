/// The in-memory store used by tests and the admin CLI.
pub mod memory;

//! Test helpers: a scripted in-memory handler and waiting utilities.

mod handler;

pub use handler::MemoryHandler;

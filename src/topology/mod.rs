//! Process topology: the worker group every collective runs on.

pub mod group;

pub use group::{PassGuard, Worker, WorkerGroup};

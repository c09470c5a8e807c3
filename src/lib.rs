//! Sequential program queue: runs queued executables one at a time,
//! captures their output the way a terminal would show it, and keeps the
//! queue across restarts.

pub mod app;
pub mod manager;
pub mod models;
pub mod output;
pub mod persistence;
pub mod process;
pub mod worker;

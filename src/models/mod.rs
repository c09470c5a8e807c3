pub mod entry;
pub mod error;
pub mod event;
pub mod message;

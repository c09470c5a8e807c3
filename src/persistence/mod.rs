pub mod autosave;
pub mod codec;
pub mod store;

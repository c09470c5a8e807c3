pub mod decoder;
pub mod transcoder;

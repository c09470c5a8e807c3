pub mod controller;
pub mod tree;

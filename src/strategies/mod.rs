pub mod edge;
pub mod types;

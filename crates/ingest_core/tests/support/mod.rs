pub mod fixtures;
pub mod platform;

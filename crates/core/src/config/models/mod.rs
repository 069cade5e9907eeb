pub mod app_config;
pub mod cluster;
pub mod coordination;
pub mod engines;

pub use app_config::*;
pub use cluster::*;
pub use coordination::*;
pub use engines::*;

pub mod config;
pub mod event;
pub mod gateway;
pub mod net_tool;
pub mod useragent;

pub use gateway::Gateway;

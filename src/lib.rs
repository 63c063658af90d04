pub mod config;
pub mod context;
pub mod core;
pub mod device;
pub mod epub;
pub mod error;
pub mod imaging;
pub mod logging;
pub mod simulator;

pub mod config;
pub mod credentials;
pub mod logging;
pub mod remote;
pub mod sync;

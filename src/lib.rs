pub mod capacity;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod worker;

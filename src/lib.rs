pub mod cascade;
pub mod config;
pub mod messages;
pub mod net;
pub mod sort;

pub mod command;
pub mod config;
pub mod dns;
pub mod iface;
pub mod logging;
pub mod protocol;
pub mod route;

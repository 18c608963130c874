pub mod app;
pub mod auth;
pub mod client_ip;
pub mod config;
pub mod gate;
pub mod net;
pub mod playlist;
pub mod proxy;
pub mod rate_limit;
pub mod state;
pub mod target;

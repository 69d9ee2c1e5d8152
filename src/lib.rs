pub mod cloudflare;
pub mod config;
pub mod dispatcher;
pub mod menu;
pub mod polling;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod telegram;
pub mod webhook;

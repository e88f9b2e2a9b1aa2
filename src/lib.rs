pub mod config;
pub mod dcc;
pub mod error;
pub mod irc;
pub mod logbuf;
pub mod tls;
pub mod web;

#![allow(clippy::needless_return)]

mod app_state;
pub mod auth;
pub mod config;
pub mod constants;
mod connection;
mod email;
mod filter;
pub mod jobs;
mod logging;
mod migrations;
pub mod queue;
mod response;
mod server;
pub mod storage;
pub mod util;
mod value_notifier;

pub use app_state::AppState;
pub use connection::connect_sqlite;
pub use response::Envelope;
pub use server::{InitError, ServeError, Server, ServerOptions};
pub use value_notifier::{Computed, ValueNotifier};

pub use quern_sqlite::Connection;

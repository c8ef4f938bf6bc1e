#![allow(clippy::needless_return)]

mod connection;
mod error;
pub mod params;

pub use connection::{Connection, Options};
pub use error::Error;
pub use params::Params;

/// The result returned on method calls in this crate.
pub type Result<T> = std::result::Result<T, Error>;

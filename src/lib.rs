pub mod auth;
pub mod chat;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod mail;
pub mod store;

pub use error::{DcpError, Result};

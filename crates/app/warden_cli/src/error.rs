use thiserror::Error;
use warden_core::auth::TokenError;
use warden_core::auth::secret::SecretError;
use warden_core::config::ConfigError;
use warden_core::store::StoreError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{}", .0)]
    Custom(String),

    #[error("IO::{:?}: {}", .0, .0)]
    Io(#[from] std::io::Error),

    #[error("FlexiLogger::{:?}: {}", .0, .0)]
    FlexiLogger(#[from] flexi_logger::FlexiLoggerError),

    #[error("Config: {}", .0)]
    Config(#[from] ConfigError),

    #[error("Secret: {}", .0)]
    Secret(#[from] SecretError),

    #[error("{}", .0)]
    Store(#[from] StoreError),

    #[error("{}", .0)]
    Token(#[from] TokenError),
}

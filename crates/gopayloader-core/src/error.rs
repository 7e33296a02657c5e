//! Terminal error type for the core crate.
//!
//! Per-request transport failures are not represented here; workers count
//! those in their error histogram and keep going (see `http_clients`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config: {0}")]
    Config(String),

    #[error("jwt signer: no supported jwt signing algorithm for the supplied key")]
    NoSigner,

    #[error("jwt cache corrupt: {0}")]
    CorruptCache(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("client setup: {0}")]
    ClientSetup(String),

    #[error("jwt: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("cache directory couldn't be determined")]
    NoCacheDir,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

//! Error type shared by the supervisor, the client and the grammar helpers.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Rejected before any process or network action.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("llama-server failed to launch: {message}\nlast output:\n{output}")]
    Launch { message: String, output: String },

    #[error("{what} did not succeed within {after:.1?}")]
    Timeout { what: String, after: Duration },

    /// The server is still loading the model. Retried by the client.
    #[error("server is loading (HTTP {status}): {body}")]
    Loading { status: u16, body: String },

    #[error("malformed request to {url} (HTTP {status}): {body}")]
    BadRequest { status: u16, url: String, body: String },

    #[error("server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("invalid grammar input: {0}")]
    Grammar(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn launch<S: Into<String>>(message: S, output: impl Into<String>) -> Self {
        Error::Launch {
            message: message.into(),
            output: output.into(),
        }
    }

    pub fn timeout<S: Into<String>>(what: S, after: Duration) -> Self {
        Error::Timeout {
            what: what.into(),
            after,
        }
    }

    /// True for the "model still loading" condition the client retries on.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Loading { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

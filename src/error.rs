// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Statefile error: {0}")]
    State(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("Endpoint rejected payload (status code {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

//! # Error handling utilities.
//! Setup stages use the generic anyhow error type, the response loop reports
//! its abort reasons through `HandshakeError` so callers can tell them apart.

use std::{io, time::Duration};

use thiserror::Error;

pub type Result<T> = anyhow::Result<T>;

/// Reasons the AT handshake stops without reaching a positive result.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The modem answered with an `ERROR` line.
    #[error("Modem refused to enter CMUX mode: {0}")]
    Refused(String),

    /// The response buffer filled up without a line terminator.
    #[error("Receive buffer overflow")]
    Overflow,

    /// Nothing arrived within the response timeout.
    #[error("Modem does not reply after {0:?}")]
    Timeout(Duration),

    /// The line could not be switched to non-blocking mode.
    #[error("cannot switch non-blocking mode: {0}")]
    Mode(#[source] io::Error),

    /// Waiting for readability failed or was interrupted.
    #[error("poll failed: {0}")]
    Wait(#[source] io::Error),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    /// The line reported readable but returned no data.
    #[error("serial line closed")]
    Closed,
}

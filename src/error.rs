// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Crate-wide error taxonomy.
//!
//! Every fallible operation of the middleware resolves to one of the
//! [`SeError`] variants below. Transport failures bubble up from the terminal
//! driver as [`TerminalError`](crate::terminal::TerminalError) and are folded
//! into this taxonomy at the engine boundary; card status words are folded in
//! through [`sw_error`].

use thiserror::Error;

use crate::{apdu::sw::SwClass, terminal::TerminalError, tlv::TlvError};

pub type SeResult<T> = Result<T, SeError>;

#[derive(Debug, Error)]
pub enum SeError {
    /// Null/invalid input: bad AID length, bad PIN length, invalid
    /// FID/SFI/record number, malformed path.
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// AID/applet/file/record not present on the secure element.
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    /// Access control denial, wrong/blocked PIN, security status not
    /// satisfied.
    #[error("access denied: {0}")]
    SecurityDenied(String),

    /// Operation on a channel (or its owning session) that is already closed.
    #[error("channel is closed")]
    ChannelClosed,

    /// Service or terminal driver is not bound.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The secure element has no free logical channel slot.
    #[error("no free logical channel")]
    ResourceExhausted,

    /// The SE or the driver does not support the requested operation.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// TLV/FCP/ASN.1 parse failure.
    #[error(transparent)]
    Malformed(#[from] TlvError),

    /// Transport-layer failure reported by the terminal driver.
    #[error("driver i/o failure: {0}")]
    DriverIo(String),

    /// Invariant violation. Should never surface to a well-behaved client.
    #[error("invariant violated: {0}")]
    Fatal(String),
}

impl From<TerminalError> for SeError {
    fn from(e: TerminalError) -> Self {
        match e {
            TerminalError::NoSuchElement => {
                SeError::ReferenceNotFound("applet or file not found".into())
            },
            TerminalError::MissingResource => SeError::ResourceExhausted,
            TerminalError::SecurityStatusNotSatisfied => {
                SeError::SecurityDenied("security status not satisfied".into())
            },
            TerminalError::Unsupported(what) => SeError::UnsupportedOperation(what),
            TerminalError::Io(msg) => SeError::DriverIo(msg),
        }
    }
}

/// Table-driven mapping from a classified status word to the error surfaced
/// to the caller. The raw SW is kept in 4-hex-digit form whenever the SW was
/// the source of the failure.
pub fn sw_error(sw: u16) -> SeError {
    match SwClass::classify(sw) {
        SwClass::Ok | SwClass::Warning62(_) | SwClass::Warning63(_) => {
            SeError::Fatal(format!("successful SW {sw:04X} mapped to an error"))
        },
        SwClass::FileNotFound => {
            SeError::ReferenceNotFound(format!("file or application (SW={sw:04X})"))
        },
        SwClass::RecordNotFound => {
            SeError::ReferenceNotFound(format!("record (SW={sw:04X})"))
        },
        SwClass::RefNotFound => {
            SeError::ReferenceNotFound(format!("referenced data (SW={sw:04X})"))
        },
        SwClass::SecurityNotSatisfied => {
            SeError::SecurityDenied(format!("security status not satisfied (SW={sw:04X})"))
        },
        SwClass::AuthMethodBlocked => {
            SeError::SecurityDenied(format!("authentication method blocked (SW={sw:04X})"))
        },
        SwClass::RetryCounter(left) => SeError::SecurityDenied(format!(
            "verification failed, {left} retries remaining (SW={sw:04X})"
        )),
        SwClass::RefDataNotUsable => {
            SeError::SecurityDenied(format!("reference data not usable (SW={sw:04X})"))
        },
        SwClass::FuncNotSupported => {
            SeError::UnsupportedOperation(format!("function not supported (SW={sw:04X})"))
        },
        SwClass::InsNotSupported => {
            SeError::UnsupportedOperation(format!("instruction not supported (SW={sw:04X})"))
        },
        SwClass::CommandIncompatible => {
            SeError::Parameter(format!("command incompatible with file (SW={sw:04X})"))
        },
        SwClass::CommandNotAllowed => {
            SeError::SecurityDenied(format!("command not allowed (SW={sw:04X})"))
        },
        SwClass::WrongLength => SeError::Parameter(format!("wrong length (SW={sw:04X})")),
        SwClass::WrongData => SeError::Parameter(format!("wrong data (SW={sw:04X})")),
        SwClass::WrongP1P2 => SeError::Parameter(format!("wrong P1/P2 (SW={sw:04X})")),
        SwClass::MemoryFailure => SeError::DriverIo(format!("memory failure (SW={sw:04X})")),
        SwClass::NotEnoughMemory => {
            SeError::DriverIo(format!("not enough memory on card (SW={sw:04X})"))
        },
        SwClass::GetResponseAvailable(_) | SwClass::WrongLe(_) => SeError::Fatal(format!(
            "transport SW {sw:04X} leaked past the response post-processing loop"
        )),
        SwClass::Other(sw) => SeError::DriverIo(format!("unexpected status word {sw:04X}")),
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Terminal driver abstraction.
//!
//! A terminal driver owns the raw transport to one secure element slot
//! (UICC behind a modem, embedded SE behind an NFC controller, SD-card SE).
//! The engine serializes access to a driver through [`TerminalHandle`]: a
//! driver is never assumed to be internally concurrent, and an APDU together
//! with its GET RESPONSE continuations is exchanged under one exclusive
//! guard.

pub mod exchange;
pub mod mock;

use std::{fmt, sync::Arc};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TerminalError {
    /// SELECT failed: the applet/file does not exist on the SE.
    #[error("no such applet or file on the secure element")]
    NoSuchElement,
    /// The SE has no free logical channel.
    #[error("no free logical channel on the secure element")]
    MissingResource,
    #[error("security status not satisfied")]
    SecurityStatusNotSatisfied,
    #[error("not supported by this terminal: {0}")]
    Unsupported(String),
    #[error("terminal i/o: {0}")]
    Io(String),
}

/// Result of `MANAGE CHANNEL open` + `SELECT` performed by the driver.
#[derive(Debug, Clone)]
pub struct OpenChannelResponse {
    /// 1..=19; drivers never hand out the basic channel.
    pub channel: u8,
    /// Raw SELECT response including its status word.
    pub select_response: Bytes,
}

/// Secure-element state transitions delivered out of band by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeEvent {
    Inserted,
    Removed,
    /// Same card, new card session (e.g. modem-initiated reset).
    Reset,
}

/// Legacy SIM-IO file exchange used when the platform routes ARF reads over
/// the telephony stack instead of a logical channel.
#[derive(Debug, Clone)]
pub struct SimIoRequest {
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub p3: u8,
    pub data: Bytes,
}

/// The transport contract the engine consumes.
///
/// `transmit` must forward the CLA byte untouched: channel encoding is the
/// engine's job. Drivers should not run GET RESPONSE loops of their own.
pub trait TerminalDriver: Send + Sync {
    /// Answer-To-Reset of the present card, when the transport exposes it.
    fn atr(&self) -> Option<Bytes>;

    fn is_card_present(&self) -> bool;

    fn open_logical_channel(
        &self,
        aid: Option<&[u8]>,
        p2: u8,
    ) -> Result<OpenChannelResponse, TerminalError>;

    fn close_logical_channel(&self, channel: u8) -> Result<(), TerminalError>;

    fn transmit(&self, apdu: &[u8]) -> Result<Bytes, TerminalError>;

    /// Optional legacy file access path.
    fn sim_io_exchange(
        &self,
        file_id: u16,
        path: &[u8],
        command: SimIoRequest,
    ) -> Result<Bytes, TerminalError> {
        let _ = (file_id, path, command);
        Err(TerminalError::Unsupported("SIM-IO exchange".into()))
    }

    /// Whether `transmit` accepts extended-length APDUs. When it does not,
    /// the engine falls back to ENVELOPE chaining.
    fn supports_extended_length(&self) -> bool {
        false
    }

    /// State-change stream; `None` for transports without removal events.
    fn events(&self) -> Option<Receiver<SeEvent>> {
        None
    }
}

/// Terminal types recognized by the registry. The order of the variants is
/// the enumeration order of readers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TerminalKind {
    Sim,
    Ese,
    Sd,
    Other(String),
}

impl TerminalKind {
    /// Canonical reader-name prefix (case matters: `SIM1`, `eSE1`, `SD1`).
    pub fn prefix(&self) -> &str {
        match self {
            TerminalKind::Sim => "SIM",
            TerminalKind::Ese => "eSE",
            TerminalKind::Sd => "SD",
            TerminalKind::Other(name) => name,
        }
    }

    fn rank(&self) -> usize {
        match self {
            TerminalKind::Sim => 0,
            TerminalKind::Ese => 1,
            TerminalKind::Sd => 2,
            TerminalKind::Other(_) => 3,
        }
    }

    /// Sort key for reader enumeration: SIM* before eSE* before SD* before
    /// everything else (which keeps insertion order).
    pub fn enumeration_order(a: &TerminalKind, b: &TerminalKind) -> std::cmp::Ordering {
        a.rank().cmp(&b.rank())
    }
}

bitflags::bitflags! {
    /// Permissions a terminal provider declares at discovery time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProviderPermissions: u8 {
        /// Required of every provider.
        const BIND_TERMINAL = 0x01;
        /// Additionally required for the system terminal types
        /// (SIM/eSE/SD).
        const SYSTEM_TERMINAL = 0x02;
    }
}

/// Discovery-time description of a terminal back-end.
pub trait TerminalProvider: Send + Sync {
    fn kind(&self) -> TerminalKind;

    fn permissions(&self) -> ProviderPermissions;

    /// Binds the transport. An `Err` here still produces a reader; it just
    /// permanently reports an absent card.
    fn connect(&self) -> anyhow::Result<Arc<dyn TerminalDriver>>;
}

/// Stand-in for a driver that was discovered but failed to bind. Keeps the
/// reader enumerable while every operation reports the terminal as absent.
#[derive(Debug, Default)]
pub struct DeadTerminal;

impl TerminalDriver for DeadTerminal {
    fn atr(&self) -> Option<Bytes> {
        None
    }

    fn is_card_present(&self) -> bool {
        false
    }

    fn open_logical_channel(
        &self,
        _aid: Option<&[u8]>,
        _p2: u8,
    ) -> Result<OpenChannelResponse, TerminalError> {
        Err(TerminalError::Io("terminal failed to initialize".into()))
    }

    fn close_logical_channel(&self, _channel: u8) -> Result<(), TerminalError> {
        Err(TerminalError::Io("terminal failed to initialize".into()))
    }

    fn transmit(&self, _apdu: &[u8]) -> Result<Bytes, TerminalError> {
        Err(TerminalError::Io("terminal failed to initialize".into()))
    }
}

/// Serialization wrapper around a driver.
///
/// All card I/O flows through [`TerminalHandle::exclusive`]; holding the
/// returned guard across a multi-exchange sequence (GET RESPONSE loop,
/// ENVELOPE chain, rule-file walk) is what gives the per-reader total order
/// of APDUs.
pub struct TerminalHandle {
    driver: Arc<dyn TerminalDriver>,
    io: Mutex<()>,
}

impl fmt::Debug for TerminalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalHandle").finish_non_exhaustive()
    }
}

impl TerminalHandle {
    pub fn new(driver: Arc<dyn TerminalDriver>) -> Self {
        Self { driver, io: Mutex::new(()) }
    }

    /// Lock-free card probes; drivers answer these from cached state.
    pub fn atr(&self) -> Option<Bytes> {
        self.driver.atr()
    }

    pub fn is_card_present(&self) -> bool {
        self.driver.is_card_present()
    }

    pub fn supports_extended_length(&self) -> bool {
        self.driver.supports_extended_length()
    }

    pub fn events(&self) -> Option<Receiver<SeEvent>> {
        self.driver.events()
    }

    /// Takes the transmit lock for a sequence of exchanges.
    pub fn exclusive(&self) -> TerminalExclusive<'_> {
        TerminalExclusive {
            driver: &self.driver,
            _guard: self.io.lock(),
        }
    }
}

/// Exclusive access to the driver for one command sequence.
pub struct TerminalExclusive<'a> {
    driver: &'a Arc<dyn TerminalDriver>,
    _guard: MutexGuard<'a, ()>,
}

impl TerminalExclusive<'_> {
    pub fn transmit(&self, apdu: &[u8]) -> Result<Bytes, TerminalError> {
        self.driver.transmit(apdu)
    }

    pub fn supports_extended_length(&self) -> bool {
        self.driver.supports_extended_length()
    }

    pub fn open_logical_channel(
        &self,
        aid: Option<&[u8]>,
        p2: u8,
    ) -> Result<OpenChannelResponse, TerminalError> {
        self.driver.open_logical_channel(aid, p2)
    }

    pub fn close_logical_channel(&self, channel: u8) -> Result<(), TerminalError> {
        self.driver.close_logical_channel(channel)
    }

    pub fn sim_io_exchange(
        &self,
        file_id: u16,
        path: &[u8],
        command: SimIoRequest,
    ) -> Result<Bytes, TerminalError> {
        self.driver.sim_io_exchange(file_id, path, command)
    }
}

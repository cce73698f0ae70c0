// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One ISO 7816-4 channel: the basic channel (number 0) or a logical
//! channel (1..=19).
//!
//! A channel is created `Open` (the opening handshake happens before the
//! value exists, so a failed open never leaks a handle) and dies exactly
//! once. Its access decision is immutable after open; its mutex serializes
//! `transmit`, `select_next` and `close` and is held across the whole
//! response post-processing loop.

use std::sync::Weak;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    ace::{ChannelAccess, Enforcer},
    apdu::{
        CommandApdu, cla,
        command::{self, ins, select_mode},
        sw::SwClass,
    },
    error::{SeError, SeResult},
    service::{client::ClientContext, session::Session},
    terminal::{TerminalHandle, exchange},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

pub struct Channel {
    number: u8,
    aid: Option<Bytes>,
    access: ChannelAccess,
    pid: i32,
    session: Weak<Session>,
    select_response: Mutex<Option<Bytes>>,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub(crate) fn new(
        number: u8,
        aid: Option<Bytes>,
        select_response: Option<Bytes>,
        access: ChannelAccess,
        pid: i32,
        session: Weak<Session>,
    ) -> Self {
        Self {
            number,
            aid,
            access,
            pid,
            session,
            select_response: Mutex::new(select_response),
            state: Mutex::new(ChannelState::Opening),
        }
    }

    /// Flips `Opening` to `Open` once the channel is registered with its
    /// session; only then is the handle usable.
    pub(crate) fn activate(&self) {
        let mut state = self.state.lock();
        if *state == ChannelState::Opening {
            *state = ChannelState::Open;
        }
    }

    #[inline]
    pub fn number(&self) -> u8 {
        self.number
    }

    #[inline]
    pub fn is_basic(&self) -> bool {
        self.number == 0
    }

    pub fn aid(&self) -> Option<Bytes> {
        self.aid.clone()
    }

    /// Raw SELECT response recorded at open (or by the last SELECT NEXT),
    /// including its status word.
    pub fn select_response(&self) -> Option<Bytes> {
        self.select_response.lock().clone()
    }

    pub fn access(&self) -> &ChannelAccess {
        &self.access
    }

    pub fn calling_pid(&self) -> i32 {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), ChannelState::Closed)
    }

    fn check_caller(&self, ctx: &ClientContext) -> SeResult<()> {
        if ctx.pid != self.pid {
            return Err(SeError::SecurityDenied(format!(
                "channel belongs to pid {}, caller is {}",
                self.pid, ctx.pid
            )));
        }
        Ok(())
    }

    /// Client-facing APDU exchange.
    pub fn transmit(&self, ctx: &ClientContext, raw: &[u8]) -> SeResult<Bytes> {
        let state = self.state.lock();
        if *state != ChannelState::Open {
            return Err(SeError::ChannelClosed);
        }
        if raw.len() < 4 {
            return Err(SeError::Parameter(format!(
                "command APDU too short: {} bytes",
                raw.len()
            )));
        }
        self.check_caller(ctx)?;
        if command::is_forbidden(raw) {
            return Err(SeError::SecurityDenied(
                "MANAGE CHANNEL and SELECT by DF name are not allowed".into(),
            ));
        }
        Enforcer::check_command(&self.access, raw)?;

        let mut cmd = CommandApdu::parse(raw)?;
        cmd.cla = cla::set_channel(cmd.cla, self.number)?;

        let reader = self.reader()?;
        let io = reader.terminal().exclusive();
        let resp = exchange::exchange(&io, &cmd)?;
        Ok(resp.to_bytes())
    }

    /// SELECT Next on the applet this channel was opened with. `false`
    /// means the card has no further matching applet; the stored select
    /// response is cleared in that case.
    pub fn select_next(&self, ctx: &ClientContext) -> SeResult<bool> {
        let state = self.state.lock();
        if *state != ChannelState::Open {
            return Err(SeError::ChannelClosed);
        }
        self.check_caller(ctx)?;
        let aid = self.aid.clone().ok_or_else(|| {
            SeError::UnsupportedOperation("SELECT NEXT without a selected applet".into())
        })?;

        let cmd = CommandApdu::new(
            cla::set_channel(0x00, self.number)?,
            ins::SELECT,
            select_mode::BY_DF_NAME,
            0x02,
        )
        .with_data(aid)
        .with_le(0);

        let reader = self.reader()?;
        let io = reader.terminal().exclusive();
        let resp = exchange::exchange(&io, &cmd)?;

        match resp.class() {
            c if c.is_select_success() => {
                *self.select_response.lock() = Some(resp.to_bytes());
                Ok(true)
            },
            SwClass::FileNotFound => {
                *self.select_response.lock() = None;
                Ok(false)
            },
            _ => Err(SeError::UnsupportedOperation(format!(
                "SELECT NEXT answered SW {:04X}",
                resp.sw()
            ))),
        }
    }

    /// Client-facing close. Idempotent; a second close neither errors nor
    /// reaches the driver.
    pub fn close(&self, ctx: &ClientContext) -> SeResult<()> {
        self.check_caller(ctx)?;
        match self.session.upgrade().and_then(|s| s.reader()) {
            Some(reader) => {
                reader.close_channel(self);
            },
            None => {
                // The owners are already gone; nothing left to release.
                *self.state.lock() = ChannelState::Closed;
            },
        }
        Ok(())
    }

    fn reader(&self) -> SeResult<std::sync::Arc<crate::service::reader::Reader>> {
        self.session
            .upgrade()
            .and_then(|s| s.reader())
            .ok_or(SeError::ChannelClosed)
    }

    /// Releases the card-side slot and detaches from the session. Runs with
    /// the reader lock held; returns whether this call performed the close.
    pub(crate) fn force_close(&self, handle: &TerminalHandle) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, ChannelState::Closed | ChannelState::Closing) {
            return false;
        }
        *state = ChannelState::Closing;

        if self.number == 0 {
            // Best-effort return to the default application; the basic
            // channel itself cannot be closed.
            if self.aid.is_some() {
                let deselect =
                    CommandApdu::new(0x00, ins::SELECT, select_mode::BY_DF_NAME, 0x00);
                let io = handle.exclusive();
                match exchange::exchange(&io, &deselect) {
                    Ok(resp) if resp.class().is_select_success() => {},
                    Ok(resp) => {
                        debug!(sw = %format!("{:04X}", resp.sw()), "deselect refused")
                    },
                    Err(e) => debug!(error = %e, "deselect failed"),
                }
            }
        } else {
            let io = handle.exclusive();
            if let Err(e) = io.close_logical_channel(self.number) {
                warn!(channel = self.number, error = %e, "failed to release logical channel");
            }
        }

        if let Some(session) = self.session.upgrade() {
            session.detach_channel(self.number);
        }
        *state = ChannelState::Closed;
        true
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.number)
            .field("aid", &self.aid.as_ref().map(hex::encode))
            .field("pid", &self.pid)
            .field("state", &*self.state.lock())
            .finish()
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A client's view of one reader with one physical card instantiation.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::{
    error::{SeError, SeResult},
    service::{channel::Channel, client::ClientContext, reader::Reader},
};

/// AIDs are 5..=16 bytes; absent means "the default application".
fn validate_aid(aid: Option<&[u8]>) -> SeResult<()> {
    match aid {
        None => Ok(()),
        Some(aid) if (5..=16).contains(&aid.len()) => Ok(()),
        Some(aid) => Err(SeError::Parameter(format!(
            "AID length {} outside 5..=16",
            aid.len()
        ))),
    }
}

pub struct Session {
    reader: Weak<Reader>,
    /// Captured once at session creation; a later SE reset yields a new
    /// session rather than a new ATR here.
    atr: Option<Bytes>,
    owner_pid: i32,
    channels: DashMap<u8, Arc<Channel>>,
    closed: AtomicBool,
    self_weak: OnceCell<Weak<Session>>,
}

impl Session {
    pub(crate) fn new(reader: Weak<Reader>, atr: Option<Bytes>, owner_pid: i32) -> Arc<Self> {
        let session = Arc::new(Self {
            reader,
            atr,
            owner_pid,
            channels: DashMap::new(),
            closed: AtomicBool::new(false),
            self_weak: OnceCell::new(),
        });
        let _ = session.self_weak.set(Arc::downgrade(&session));
        session
    }

    pub fn atr(&self) -> Option<Bytes> {
        self.atr.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn owner_pid(&self) -> i32 {
        self.owner_pid
    }

    fn check_open(&self, ctx: &ClientContext) -> SeResult<()> {
        if self.is_closed() {
            return Err(SeError::ChannelClosed);
        }
        if ctx.pid != self.owner_pid {
            return Err(SeError::SecurityDenied(format!(
                "session belongs to pid {}, caller is {}",
                self.owner_pid, ctx.pid
            )));
        }
        Ok(())
    }

    fn reader_or_gone(&self) -> SeResult<Arc<Reader>> {
        self.reader
            .upgrade()
            .ok_or_else(|| SeError::NotConnected("reader is shut down".into()))
    }

    fn self_arc(&self) -> SeResult<Arc<Session>> {
        self.self_weak
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SeError::Fatal("session self-reference lost".into()))
    }

    /// Opens a logical channel, optionally SELECTing `aid` on it. `p2`
    /// qualifies the SELECT (first/next/last occurrence).
    pub fn open_logical_channel(
        &self,
        aid: Option<&[u8]>,
        p2: u8,
        ctx: &ClientContext,
    ) -> SeResult<Arc<Channel>> {
        self.check_open(ctx)?;
        validate_aid(aid)?;
        let reader = self.reader_or_gone()?;
        reader.open_logical_channel(&self.self_arc()?, aid, p2, ctx)
    }

    /// Opens the basic channel. `None` is returned when the slot is taken
    /// or, for `aid == None`, when the default application is no longer
    /// selected.
    pub fn open_basic_channel(
        &self,
        aid: Option<&[u8]>,
        p2: u8,
        ctx: &ClientContext,
    ) -> SeResult<Option<Arc<Channel>>> {
        self.check_open(ctx)?;
        validate_aid(aid)?;
        let reader = self.reader_or_gone()?;
        reader.open_basic_channel(&self.self_arc()?, aid, p2, ctx)
    }

    /// Closes the session and every channel it owns.
    pub fn close(&self, ctx: &ClientContext) -> SeResult<()> {
        if ctx.pid != self.owner_pid {
            return Err(SeError::SecurityDenied(format!(
                "session belongs to pid {}, caller is {}",
                self.owner_pid, ctx.pid
            )));
        }
        if let Some(reader) = self.reader.upgrade() {
            reader.close_session(self);
        } else {
            self.mark_closed();
        }
        Ok(())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, number: u8) -> Option<Arc<Channel>> {
        self.channels.get(&number).map(|c| c.clone())
    }

    // ---- engine-internal hooks ---------------------------------------

    pub(crate) fn reader(&self) -> Option<Arc<Reader>> {
        self.reader.upgrade()
    }

    pub(crate) fn attach_channel(&self, channel: Arc<Channel>) {
        self.channels.insert(channel.number(), channel);
    }

    pub(crate) fn detach_channel(&self, number: u8) {
        self.channels.remove(&number);
    }

    pub(crate) fn channels_snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("owner_pid", &self.owner_pid)
            .field("channels", &self.channels.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

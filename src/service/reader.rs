// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One named transport endpoint and everything scoped to it: sessions, the
//! basic-channel slot, the default-application flag and the access-rule
//! state.
//!
//! A single mutex guards all of that; card I/O performed under it follows
//! the reader → terminal lock order shared by every path in the engine.

use std::{
    sync::{Arc, Weak},
    thread,
};

use bytes::Bytes;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    ace::{AccessDecision, Enforcer},
    apdu::{CommandApdu, cla, command::ins, command::select_mode},
    error::{SeError, SeResult},
    service::{
        channel::Channel,
        client::{ClientContext, ClientIdentity},
        session::Session,
    },
    terminal::{SeEvent, TerminalHandle, exchange},
};

struct ReaderInner {
    sessions: Vec<Arc<Session>>,
    basic_channel_in_use: bool,
    /// True while nothing was explicitly selected on the basic channel
    /// since the card session began.
    default_app_selected: bool,
    enforcer: Enforcer,
}

pub struct Reader {
    name: String,
    handle: TerminalHandle,
    identity: Arc<dyn ClientIdentity>,
    inner: Mutex<ReaderInner>,
    self_weak: OnceCell<Weak<Reader>>,
}

impl Reader {
    pub(crate) fn new(
        name: String,
        handle: TerminalHandle,
        enforcer: Enforcer,
        identity: Arc<dyn ClientIdentity>,
    ) -> Arc<Self> {
        let reader = Arc::new(Self {
            name,
            handle,
            identity,
            inner: Mutex::new(ReaderInner {
                sessions: Vec::new(),
                basic_channel_in_use: false,
                default_app_selected: true,
                enforcer,
            }),
            self_weak: OnceCell::new(),
        });
        let _ = reader.self_weak.set(Arc::downgrade(&reader));
        reader
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_card_present(&self) -> bool {
        self.handle.is_card_present()
    }

    pub(crate) fn terminal(&self) -> &TerminalHandle {
        &self.handle
    }

    /// Opens a session against the present card, capturing its ATR. The
    /// first session after an SE state change also (re)validates the
    /// access rules, so this call may block on card I/O.
    pub fn open_session(&self, ctx: &ClientContext) -> SeResult<Arc<Session>> {
        if !self.handle.is_card_present() {
            return Err(SeError::NotConnected("secure element not present".into()));
        }
        let weak = self
            .self_weak
            .get()
            .cloned()
            .ok_or_else(|| SeError::Fatal("reader self-reference lost".into()))?;
        let session = Session::new(weak, self.handle.atr(), ctx.pid);
        {
            let mut inner = self.inner.lock();
            inner.enforcer.ensure_loaded(&self.handle);
            inner.sessions.push(session.clone());
        }
        debug!(reader = %self.name, pid = ctx.pid, "session opened");
        Ok(session)
    }

    /// Closes every session (and with them every channel) of this reader.
    pub fn close_sessions(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock();
            inner.sessions.drain(..).collect()
        };
        for session in sessions {
            session.mark_closed();
            let mut inner = self.inner.lock();
            self.close_session_channels_locked(&mut inner, &session);
        }
    }

    /// NFC event gating for the event-delivery collaborator.
    pub fn nfc_event_access(
        &self,
        aid: Option<&[u8]>,
        ctx: &ClientContext,
    ) -> SeResult<AccessDecision> {
        let profile = self.identity.profile_for(ctx)?;
        let mut inner = self.inner.lock();
        Ok(inner.enforcer.nfc_event_access_for(&self.handle, aid, &profile))
    }

    // ---- channel opening ---------------------------------------------

    pub(crate) fn open_logical_channel(
        &self,
        session: &Arc<Session>,
        aid: Option<&[u8]>,
        p2: u8,
        ctx: &ClientContext,
    ) -> SeResult<Arc<Channel>> {
        let profile = self.identity.profile_for(ctx)?;
        let mut inner = self.inner.lock();

        let access = inner.enforcer.channel_access_for(&self.handle, aid, &profile);
        if access.access != AccessDecision::Allowed {
            return Err(SeError::SecurityDenied(format!(
                "open denied for {}: {}",
                profile.package, access.reason
            )));
        }

        let opened = {
            let io = self.handle.exclusive();
            io.open_logical_channel(aid, p2)?
        };
        if opened.channel == 0 || opened.channel > cla::MAX_CHANNEL {
            let io = self.handle.exclusive();
            let _ = io.close_logical_channel(opened.channel);
            return Err(SeError::Fatal(format!(
                "driver allocated channel {} outside 1..=19",
                opened.channel
            )));
        }

        let channel = Arc::new(Channel::new(
            opened.channel,
            aid.map(Bytes::copy_from_slice),
            Some(opened.select_response),
            access,
            ctx.pid,
            Arc::downgrade(session),
        ));
        session.attach_channel(channel.clone());
        channel.activate();
        info!(
            reader = %self.name,
            channel = channel.number(),
            aid = ?aid.map(hex::encode),
            "logical channel open"
        );
        Ok(channel)
    }

    pub(crate) fn open_basic_channel(
        &self,
        session: &Arc<Session>,
        aid: Option<&[u8]>,
        p2: u8,
        ctx: &ClientContext,
    ) -> SeResult<Option<Arc<Channel>>> {
        let profile = self.identity.profile_for(ctx)?;
        let mut inner = self.inner.lock();

        // One basic channel per reader; a taken slot is not an error.
        if inner.basic_channel_in_use {
            return Ok(None);
        }

        let access = inner.enforcer.channel_access_for(&self.handle, aid, &profile);
        if access.access != AccessDecision::Allowed {
            return Err(SeError::SecurityDenied(format!(
                "open denied for {}: {}",
                profile.package, access.reason
            )));
        }

        let select_response = match aid {
            None => {
                if !inner.default_app_selected {
                    return Ok(None);
                }
                None
            },
            Some(aid) => {
                let cmd =
                    CommandApdu::new(0x00, ins::SELECT, select_mode::BY_DF_NAME, p2)
                        .with_data(Bytes::copy_from_slice(aid))
                        .with_le(0);
                let io = self.handle.exclusive();
                let resp = exchange::exchange(&io, &cmd)?;
                if !resp.class().is_select_success() {
                    return Err(SeError::ReferenceNotFound(format!(
                        "no applet for AID {} (SW={:04X})",
                        hex::encode(aid),
                        resp.sw()
                    )));
                }
                inner.default_app_selected = false;
                Some(resp.to_bytes())
            },
        };

        inner.basic_channel_in_use = true;
        let channel = Arc::new(Channel::new(
            0,
            aid.map(Bytes::copy_from_slice),
            select_response,
            access,
            ctx.pid,
            Arc::downgrade(session),
        ));
        session.attach_channel(channel.clone());
        channel.activate();
        info!(reader = %self.name, aid = ?aid.map(hex::encode), "basic channel open");
        Ok(Some(channel))
    }

    // ---- teardown ----------------------------------------------------

    pub(crate) fn close_channel(&self, channel: &Channel) {
        let mut inner = self.inner.lock();
        if channel.force_close(&self.handle) && channel.is_basic() {
            inner.basic_channel_in_use = false;
        }
    }

    pub(crate) fn close_session(&self, session: &Session) {
        session.mark_closed();
        let mut inner = self.inner.lock();
        self.close_session_channels_locked(&mut inner, session);
        inner
            .sessions
            .retain(|s| !std::ptr::eq(s.as_ref(), session));
    }

    fn close_session_channels_locked(&self, inner: &mut ReaderInner, session: &Session) {
        for channel in session.channels_snapshot() {
            if channel.force_close(&self.handle) && channel.is_basic() {
                inner.basic_channel_in_use = false;
            }
        }
    }

    /// Client-death cleanup: release every channel owned by `pid`.
    pub(crate) fn client_died(&self, pid: i32) {
        let mut inner = self.inner.lock();
        let sessions = inner.sessions.clone();
        for session in &sessions {
            for channel in session.channels_snapshot() {
                if channel.calling_pid() != pid {
                    continue;
                }
                debug!(reader = %self.name, channel = channel.number(), pid, "closing channel of dead client");
                if channel.force_close(&self.handle) && channel.is_basic() {
                    inner.basic_channel_in_use = false;
                }
            }
        }
    }

    /// SE state transitions invalidate everything scoped to the old card
    /// session. Called from the driver event pump; platform layers without
    /// an event stream may call it directly.
    pub fn on_se_state_changed(&self, event: SeEvent) {
        info!(reader = %self.name, ?event, "secure element state changed");
        self.close_sessions();
        let mut inner = self.inner.lock();
        inner.enforcer.on_se_event(event);
        inner.basic_channel_in_use = false;
        inner.default_app_selected = true;
    }

    pub(crate) fn spawn_event_listener(self: &Arc<Self>) {
        let Some(events) = self.handle.events() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let name = self.name.clone();
        let name_for_error = name.clone();
        thread::Builder::new()
            .name(format!("se-events-{name}"))
            .spawn(move || {
                while let Ok(event) = events.recv() {
                    match weak.upgrade() {
                        Some(reader) => reader.on_se_state_changed(event),
                        None => break,
                    }
                }
                debug!(reader = %name, "event listener stopped");
            })
            .map(|_| ())
            .unwrap_or_else(|e| warn!(reader = %name_for_error, error = %e, "event listener not started"));
    }

    pub(crate) fn shutdown(&self) {
        self.close_sessions();
        let mut inner = self.inner.lock();
        inner.enforcer.reset();
        inner.basic_channel_in_use = false;
        inner.default_app_selected = true;
    }

    pub(crate) fn dump(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        json!({
            "name": self.name,
            "card_present": self.handle.is_card_present(),
            "atr": self.handle.atr().map(hex::encode),
            "sessions": inner.sessions.iter().map(|s| json!({
                "owner_pid": s.owner_pid(),
                "closed": s.is_closed(),
                "channels": s.channels_snapshot().iter().map(|c| json!({
                    "number": c.number(),
                    "aid": c.aid().map(hex::encode),
                    "pid": c.calling_pid(),
                })).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
            "basic_channel_in_use": inner.basic_channel_in_use,
            "default_app_selected": inner.default_app_selected,
            "access_rules": inner.enforcer.rule_count(),
            "rule_source_available": inner.enforcer.is_rule_source_available(),
        })
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("name", &self.name)
            .field("card_present", &self.is_card_present())
            .finish()
    }
}

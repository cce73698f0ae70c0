// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-reader access control enforcement.
//!
//! Owned by the reader and driven under its lock: rule loading, the
//! channel-open decision and the per-APDU check all happen here.

use tracing::{debug, warn};

use crate::{
    ace::{
        access::{AccessDecision, ChannelAccess},
        arf::{ArfController, ArfMode},
        cache::RuleCache,
    },
    error::{SeError, SeResult},
    terminal::{SeEvent, TerminalHandle},
};

/// Resolved identity of the calling client: OS process, package and the
/// SHA-1 digests of its signing certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub pid: i32,
    pub package: String,
    pub hashes: Vec<[u8; 20]>,
}

#[derive(Debug)]
pub struct Enforcer {
    controller: ArfController,
    cache: RuleCache,
    fail_closed: bool,
    /// Set when the last load attempt found no usable rule source.
    rules_unavailable: bool,
}

impl Enforcer {
    pub fn new(modes: Vec<ArfMode>, fail_closed: bool) -> Self {
        Self {
            controller: ArfController::new(modes),
            cache: RuleCache::new(),
            fail_closed,
            rules_unavailable: false,
        }
    }

    /// Loads or revalidates the rule set once per card session. A failed
    /// load disables ACE for this reader until the next SE state change;
    /// what "disabled" means is decided by the fail-closed policy.
    pub fn ensure_loaded(&mut self, handle: &TerminalHandle) {
        if self.cache.is_initialized() {
            return;
        }
        match self.controller.load(handle, &mut self.cache) {
            Ok(()) => {
                self.rules_unavailable = false;
                debug!(rules = self.cache.rule_count(), "access rules ready");
            },
            Err(e) => {
                warn!(error = %e, "access rule load failed, ACE disabled for this reader");
                self.rules_unavailable = true;
            },
        }
        // Either way, do not walk the card again until something changes.
        self.cache.set_initialized();
    }

    /// The channel-open decision for `(aid, caller)`.
    pub fn channel_access_for(
        &mut self,
        handle: &TerminalHandle,
        aid: Option<&[u8]>,
        profile: &ClientProfile,
    ) -> ChannelAccess {
        self.ensure_loaded(handle);

        let mut access = if self.rules_unavailable {
            if self.fail_closed {
                ChannelAccess::denied("access rules unavailable (fail closed)")
            } else {
                ChannelAccess::allowed("access rules unavailable (fail open, debug)")
            }
        } else {
            self.cache.lookup(aid, &profile.hashes)
        };
        access.calling_pid = profile.pid;
        access.package_name = profile.package.clone();
        access
    }

    /// NFC event gating consumes the same lookup.
    pub fn nfc_event_access_for(
        &mut self,
        handle: &TerminalHandle,
        aid: Option<&[u8]>,
        profile: &ClientProfile,
    ) -> AccessDecision {
        self.channel_access_for(handle, aid, profile).nfc_event_access
    }

    /// The per-APDU check applied on every client transmit.
    pub fn check_command(access: &ChannelAccess, command: &[u8]) -> SeResult<()> {
        if access.access != AccessDecision::Allowed {
            return Err(SeError::SecurityDenied(format!(
                "channel access not granted: {}",
                access.reason
            )));
        }
        if access.apdu_access == AccessDecision::Denied {
            return Err(SeError::SecurityDenied(
                "APDU access denied by access rule".into(),
            ));
        }
        if access.use_apdu_filter && !access.filter_matches(command) {
            return Err(SeError::SecurityDenied(
                "command blocked by APDU filter".into(),
            ));
        }
        Ok(())
    }

    pub fn on_se_event(&mut self, event: SeEvent) {
        match event {
            SeEvent::Removed => self.cache.reset(),
            SeEvent::Inserted | SeEvent::Reset => self.cache.mark_stale(),
        }
        self.rules_unavailable = false;
    }

    pub fn reset(&mut self) {
        self.cache.reset();
        self.rules_unavailable = false;
    }

    pub fn rule_count(&self) -> usize {
        self.cache.rule_count()
    }

    pub fn is_rule_source_available(&self) -> bool {
        !self.rules_unavailable
    }
}

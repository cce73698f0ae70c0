// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The access decision attached to every channel.

use std::fmt;

use crate::apdu::cla;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessDecision {
    Allowed,
    Denied,
    #[default]
    Undefined,
}

/// 4-byte header/mask pair. A command matches when its masked header equals
/// the masked filter header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ApduFilter {
    pub header: [u8; 4],
    pub mask: [u8; 4],
}

impl fmt::Debug for ApduFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ApduFilter({}/{})",
            hex::encode(self.header),
            hex::encode(self.mask)
        )
    }
}

impl ApduFilter {
    pub fn new(header: [u8; 4], mask: [u8; 4]) -> Self {
        Self { header, mask }
    }

    pub fn matches(&self, command: &[u8]) -> bool {
        if command.len() < 4 {
            return false;
        }
        (0..4).all(|i| command[i] & self.mask[i] == self.header[i] & self.mask[i])
    }
}

/// Result of the access-rule lookup for one (applet, caller) pair. Stored
/// immutably on the channel at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAccess {
    pub access: AccessDecision,
    pub apdu_access: AccessDecision,
    pub nfc_event_access: AccessDecision,
    pub use_apdu_filter: bool,
    pub apdu_filters: Vec<ApduFilter>,
    pub calling_pid: i32,
    pub package_name: String,
    pub reason: String,
}

impl Default for ChannelAccess {
    /// Denies everything; the cache hands this out on a lookup miss.
    fn default() -> Self {
        Self::denied("no access rule found")
    }
}

impl ChannelAccess {
    pub fn denied(reason: &str) -> Self {
        Self {
            access: AccessDecision::Denied,
            apdu_access: AccessDecision::Denied,
            nfc_event_access: AccessDecision::Denied,
            use_apdu_filter: false,
            apdu_filters: Vec::new(),
            calling_pid: 0,
            package_name: String::new(),
            reason: reason.to_string(),
        }
    }

    /// Full access; used by conditions that name a certificate without
    /// constraining it, and by the fail-open debug policy.
    pub fn allowed(reason: &str) -> Self {
        Self {
            access: AccessDecision::Allowed,
            apdu_access: AccessDecision::Allowed,
            nfc_event_access: AccessDecision::Allowed,
            use_apdu_filter: false,
            apdu_filters: Vec::new(),
            calling_pid: 0,
            package_name: String::new(),
            reason: reason.to_string(),
        }
    }

    /// True when `command` passes the filter list. Channel bits must already
    /// be cleared from the CLA so filters match the canonical header.
    pub fn filter_matches(&self, command: &[u8]) -> bool {
        let mut canonical = [0u8; 4];
        canonical.copy_from_slice(&command[..4]);
        canonical[0] = cla::clear_channel(canonical[0]);
        self.apdu_filters.iter().any(|f| f.matches(&canonical))
    }
}

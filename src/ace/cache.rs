// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Keyed rule store with RefreshTag bookkeeping.

use std::collections::HashMap;

use tracing::debug;

use crate::{
    ace::access::ChannelAccess,
    error::{SeError, SeResult},
};

/// AID reference of a rule, as read from the AID-REF-DO.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AidRef {
    /// Rule for one applet.
    Specific(Vec<u8>),
    /// Rule for whatever application is default-selected on the basic
    /// channel.
    Default,
    /// Wildcard rule for every applet.
    All,
}

/// Caller reference of a rule: the SHA-1 of a signing certificate, or a
/// wildcard matching any caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashRef {
    Any,
    Sha1([u8; 20]),
}

impl HashRef {
    /// Hash-REF-DO payload: empty means "any caller"; everything except a
    /// 20-byte SHA-1 is rejected.
    pub fn from_bytes(raw: &[u8]) -> SeResult<Self> {
        match raw.len() {
            0 => Ok(HashRef::Any),
            20 => {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(raw);
                Ok(HashRef::Sha1(hash))
            },
            n => Err(SeError::Parameter(format!(
                "certificate hash must be 20 bytes (SHA-1), got {n}"
            ))),
        }
    }
}

pub const REFRESH_TAG_LEN: usize = 8;

/// In-memory rule store of one reader.
#[derive(Debug, Default)]
pub struct RuleCache {
    rules: HashMap<(AidRef, HashRef), ChannelAccess>,
    refresh_tag: Option<[u8; REFRESH_TAG_LEN]>,
    initialized: bool,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later writes win on a duplicate key.
    pub fn put_rule(&mut self, aid: AidRef, hash: HashRef, access: ChannelAccess) {
        self.rules.insert((aid, hash), access);
    }

    /// Resolves the access for `aid` as seen by a caller with the given
    /// certificate hashes.
    ///
    /// Precedence: a rule for the specific AID (respectively the
    /// default-application sentinel when `aid` is `None`) wins over the
    /// all-applications wildcard, and within each AID key a
    /// specific-certificate rule wins over the any-caller rule. A complete
    /// miss denies.
    pub fn lookup(&self, aid: Option<&[u8]>, hashes: &[[u8; 20]]) -> ChannelAccess {
        let primary = match aid {
            Some(aid) => AidRef::Specific(aid.to_vec()),
            None => AidRef::Default,
        };
        for aid_ref in [primary, AidRef::All] {
            for hash in hashes {
                if let Some(access) =
                    self.rules.get(&(aid_ref.clone(), HashRef::Sha1(*hash)))
                {
                    return access.clone();
                }
            }
            if let Some(access) = self.rules.get(&(aid_ref, HashRef::Any)) {
                return access.clone();
            }
        }
        ChannelAccess::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_initialized(&mut self) {
        self.initialized = true;
    }

    /// Forces revalidation against the card without discarding rules; the
    /// next load keeps them when the RefreshTag proves unchanged.
    pub fn mark_stale(&mut self) {
        self.initialized = false;
    }

    /// Full reset: the card is gone, its rules no longer mean anything.
    pub fn reset(&mut self) {
        debug!("rule cache reset ({} rules dropped)", self.rules.len());
        self.rules.clear();
        self.refresh_tag = None;
        self.initialized = false;
    }

    /// Compares the tag read from EF(ACMain) with the cached one. Equality
    /// means the stored rules are still valid and no reload is required;
    /// otherwise the store is cleared and the new tag takes effect.
    pub fn refresh_tag_unchanged(&mut self, tag: [u8; REFRESH_TAG_LEN]) -> bool {
        if self.refresh_tag == Some(tag) {
            return true;
        }
        debug!(
            old = ?self.refresh_tag.map(hex::encode),
            new = %hex::encode(tag),
            "refresh tag changed, clearing rules"
        );
        self.rules.clear();
        self.refresh_tag = Some(tag);
        false
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

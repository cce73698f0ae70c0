// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! ARF loader: walks the on-card PKCS#15 structure and fills the rule
//! cache.
//!
//! Discovery order, per the SE Access Control spec:
//! 1. SELECT the PKCS#15 ADF on a logical channel;
//! 2. failing that, the historical GPAC ADF;
//! 3. failing that, EF(DIR) under the MF, looking for a PKCS#15 application
//!    template whose path leads to a directory holding EF(ODF) and
//!    EF(TokenInfo).
//!
//! When none of these work the enforcer treats the reader as rule-less and
//! the fail-closed policy applies.

pub mod asn1;
pub mod fs;

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::{
    ace::cache::RuleCache,
    error::{SeError, SeResult},
    terminal::{TerminalError, TerminalHandle},
    tlv::PathAttributes,
};

pub use fs::ArfMode;
use fs::{
    AC_OID, ArfFs, FID_EF_DIR, FID_EF_ODF, FID_EF_TOKEN_INFO, FID_MF, GPAC_AID,
    PKCS15_AID,
};

/// Loads the access-rule file system of one reader.
#[derive(Debug, Clone)]
pub struct ArfController {
    modes: Vec<ArfMode>,
}

impl ArfController {
    pub fn new(modes: Vec<ArfMode>) -> Self {
        Self { modes }
    }

    /// Builds (or revalidates) the rule set. On success the cache reflects
    /// the card's current RefreshTag; whether rules were re-read or kept is
    /// decided by tag equality.
    pub fn load(&self, handle: &TerminalHandle, cache: &mut RuleCache) -> SeResult<()> {
        let io = handle.exclusive();
        let mut last_err = SeError::NotConnected("no ARF access mode configured".into());
        for mode in &self.modes {
            let result = match mode {
                ArfMode::SimAlliance => load_via_channel(&io, cache),
                ArfMode::SimIo => load_via_sim_io(&io, cache),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(?mode, error = %e, "ARF mode failed");
                    last_err = e;
                },
            }
        }
        Err(last_err)
    }
}

fn load_via_channel(io: &crate::terminal::TerminalExclusive<'_>, cache: &mut RuleCache) -> SeResult<()> {
    // Preferred roots: the dedicated rule ADFs.
    for aid in [PKCS15_AID.as_slice(), GPAC_AID.as_slice()] {
        match io.open_logical_channel(Some(aid), 0x00) {
            Ok(opened) => {
                info!(aid = %hex::encode(aid), channel = opened.channel, "rule ADF selected");
                let fs = ArfFs::Channel { io, channel: opened.channel };
                let result = load_rules(&fs, &[], cache);
                if let Err(e) = io.close_logical_channel(opened.channel) {
                    warn!(channel = opened.channel, error = %e, "failed to release ARF channel");
                }
                return result;
            },
            Err(TerminalError::NoSuchElement) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    // Fallback: EF(DIR) under the MF points at a PKCS#15 directory.
    let opened = io.open_logical_channel(None, 0x00)?;
    let fs = ArfFs::Channel { io, channel: opened.channel };
    let result = dir_discovery(&fs).and_then(|root| {
        // A usable PKCS#15 directory carries both EF(ODF) and EF(TokenInfo).
        let mut odf = root.clone();
        odf.push(FID_EF_ODF);
        fs.select(&odf)?;
        let mut token_info = root.clone();
        token_info.push(FID_EF_TOKEN_INFO);
        fs.select(&token_info)?;
        load_rules(&fs, &root, cache)
    });
    if let Err(e) = io.close_logical_channel(opened.channel) {
        warn!(channel = opened.channel, error = %e, "failed to release ARF channel");
    }
    result
}

fn load_via_sim_io(io: &crate::terminal::TerminalExclusive<'_>, cache: &mut RuleCache) -> SeResult<()> {
    let fs = ArfFs::SimIo { io };
    let root = dir_discovery(&fs)?;
    // Same sanity check as the channel path: a usable PKCS#15 directory
    // carries both EF(ODF) and EF(TokenInfo).
    let mut odf = root.clone();
    odf.push(FID_EF_ODF);
    fs.select(&odf)?;
    let mut token_info = root.clone();
    token_info.push(FID_EF_TOKEN_INFO);
    fs.select(&token_info)?;
    load_rules(&fs, &root, cache)
}

/// Searches EF(DIR) for the PKCS#15 application template and returns the
/// directory path it names.
fn dir_discovery(fs: &ArfFs<'_>) -> SeResult<Vec<u16>> {
    let records = fs.read_records(&[FID_MF, FID_EF_DIR])?;
    for record in &records {
        let Some(entry) = asn1::parse_dir_record(record) else {
            continue;
        };
        if entry.aid != PKCS15_AID {
            continue;
        }
        let attrs = PathAttributes { path: entry.path, index: None, length: None };
        return Ok(attrs.fids()?);
    }
    Err(SeError::ReferenceNotFound(
        "PKCS#15 application template in EF(DIR)".into(),
    ))
}

/// Resolves a PKCS#15 path reference against the discovery root. Absolute
/// paths (leading 3F00) stand alone; relative ones live under the root.
fn resolve(attrs: &PathAttributes, root: &[u16]) -> SeResult<Vec<u16>> {
    let fids = attrs.fids()?;
    if fids.first() == Some(&FID_MF) {
        return Ok(fids);
    }
    let mut resolved = root.to_vec();
    resolved.extend_from_slice(&fids);
    Ok(resolved)
}

/// EF(ODF) → EF(DODF) → EF(ACMain) → EF(ACRules) → EF(ACConditions).
fn load_rules(fs: &ArfFs<'_>, root: &[u16], cache: &mut RuleCache) -> SeResult<()> {
    let mut odf_path = root.to_vec();
    odf_path.push(FID_EF_ODF);
    let odf = fs.read_file(&odf_path)?;

    let dodf_path = resolve(&asn1::parse_odf(&odf)?, root)?;
    let dodf = fs.read_file(&dodf_path)?;

    let ac_main_ref = asn1::parse_dodf(&dodf, AC_OID)?.ok_or_else(|| {
        SeError::ReferenceNotFound("access-control data object in EF(DODF)".into())
    })?;
    let ac_main = fs.read_file(&resolve(&ac_main_ref, root)?)?;
    let (refresh_tag, rules_ref) = asn1::parse_ac_main(&ac_main)?;

    if cache.refresh_tag_unchanged(refresh_tag) {
        debug!("refresh tag unchanged, keeping cached rules");
        return Ok(());
    }

    let rules = fs.read_file(&resolve(&rules_ref, root)?)?;
    let parsed = asn1::parse_ac_rules(&rules)?;
    info!(rules = parsed.len(), "loading access rules");

    // The same conditions file typically backs several rules; read and
    // decode it once per load.
    let mut conditions_memo: HashMap<Vec<u16>, Vec<asn1::ConditionEntry>> = HashMap::new();
    for (aid_ref, conditions_ref) in parsed {
        let path = resolve(&conditions_ref, root)?;
        if !conditions_memo.contains_key(&path) {
            let raw = fs.read_file(&path)?;
            conditions_memo.insert(path.clone(), asn1::parse_ac_conditions(&raw)?);
        }
        let entries = conditions_memo
            .get(&path)
            .ok_or_else(|| SeError::Fatal("conditions memo lost an entry".into()))?;
        for entry in entries {
            cache.put_rule(aid_ref.clone(), entry.hash, entry.access.clone());
        }
    }
    Ok(())
}

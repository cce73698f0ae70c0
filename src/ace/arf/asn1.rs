// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! DER record decoders for the access-rule file system.
//!
//! The encodings follow PKCS#15 and the GlobalPlatform SE Access Control
//! ARF annex. Implicit context tagging is used throughout, so a `[0]`
//! constructed choice arrives as `A0`, a primitive one as `80`.

use tracing::debug;

use crate::{
    ace::{
        access::{AccessDecision, ApduFilter, ChannelAccess},
        cache::{AidRef, HashRef},
    },
    error::{SeError, SeResult},
    tlv::{self, PathAttributes, TlvError},
};

const TAG_APP_TEMPLATE: u8 = 0x61;
const TAG_AID: u8 = 0x4F;
const TAG_DIR_PATH: u8 = 0x51;
const TAG_DODF_OBJECTS: u8 = 0xA7;
const TAG_OID_DO: u8 = 0xA1;
const TAG_AID_REF_CARRIER: u8 = 0xA0;
const TAG_AID_REF_DEFAULT: u8 = 0xC0;
const TAG_RULES_FOR_DEFAULT: u8 = 0x81;
const TAG_RULES_FOR_ALL: u8 = 0x82;
const TAG_ACCESS_RULES: u8 = 0xA0;
const TAG_APDU_RULE: u8 = 0xA0;
const TAG_NFC_RULE: u8 = 0xA1;
const TAG_PERMISSION: u8 = 0x80;
const TAG_FILTER_LIST: u8 = 0xA1;

fn malformed(expected: &'static str, at_offset: usize) -> SeError {
    SeError::Malformed(TlvError::Malformed { expected, at_offset })
}

/// One EF(DIR) application template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub aid: Vec<u8>,
    /// Raw path value of tag `51`: concatenated FIDs.
    pub path: Vec<u8>,
}

/// Decodes an EF(DIR) record. Records that are not application templates
/// (padding, foreign content) yield `None`.
pub fn parse_dir_record(record: &[u8]) -> Option<DirEntry> {
    let template = tlv::parse_next(record, 0).ok()?;
    if template.tag != TAG_APP_TEMPLATE {
        return None;
    }
    let body = template.value(record);
    let aid_pos = tlv::search_tag(body, TAG_AID, 0)?;
    let aid = tlv::parse_next(body, aid_pos).ok()?;
    let path_pos = tlv::search_tag(body, TAG_DIR_PATH, 0)?;
    let path = tlv::parse_next(body, path_pos).ok()?;
    Some(DirEntry {
        aid: aid.value(body).to_vec(),
        path: path.value(body).to_vec(),
    })
}

/// EF(ODF): the `A7` entry references the data-object directory.
pub fn parse_odf(bytes: &[u8]) -> SeResult<PathAttributes> {
    let pos = tlv::search_tag(bytes, TAG_DODF_OBJECTS, 0)
        .ok_or_else(|| malformed("DODF reference (A7)", 0))?;
    let entry = tlv::parse_next(bytes, pos)?;
    let (attrs, _) = tlv::parse_path_attributes(entry.value(bytes), 0)?;
    Ok(attrs)
}

/// EF(DODF): scans the OidDO entries for `oid` and returns the path of the
/// data object it describes.
pub fn parse_dodf(bytes: &[u8], oid: &str) -> SeResult<Option<PathAttributes>> {
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == 0x00 || bytes[pos] == 0xFF {
            pos += 1;
            continue;
        }
        let record = tlv::parse_next(bytes, pos)?;
        pos += record.total;
        if record.tag != TAG_OID_DO {
            continue;
        }
        let body = record.value(bytes);

        // commonObjectAttributes and class attributes precede the
        // typeAttributes choice, which is tagged [1] again.
        let Some(ta_pos) = tlv::search_tag(body, TAG_OID_DO, 0) else {
            continue;
        };
        let ta = tlv::parse_next(body, ta_pos)?;
        let mut oid_do = ta.value(body);

        // Tolerate an explicit SEQUENCE wrapper around { id, value }.
        if oid_do.first() == Some(&tlv::TAG_SEQUENCE) {
            let seq = tlv::decode_sequence(oid_do, 0)?;
            oid_do = seq.value(oid_do);
        }
        let id = tlv::expect_tag(oid_do, 0, tlv::TAG_OID, "OID in OidDO")?;
        let decoded = tlv::decode_oid(id.value(oid_do))?;
        if decoded != oid {
            debug!(oid = %decoded, "skipping unrelated data object");
            continue;
        }
        let (attrs, _) = tlv::parse_path_attributes(oid_do, id.total)?;
        return Ok(Some(attrs));
    }
    Ok(None)
}

/// EF(ACMain): `SEQUENCE { refreshTag OCTET STRING (8), rulesPath Path }`.
pub fn parse_ac_main(bytes: &[u8]) -> SeResult<([u8; 8], PathAttributes)> {
    let seq = tlv::decode_sequence(bytes, 0)?;
    let (tag_bytes, entry) = tlv::decode_octet_string(bytes, seq.value_offset)?;
    if tag_bytes.len() != 8 {
        return Err(malformed("8-byte refresh tag", entry.value_offset));
    }
    let mut refresh_tag = [0u8; 8];
    refresh_tag.copy_from_slice(tag_bytes);
    let (path, _) = tlv::parse_path_attributes(bytes, seq.value_offset + entry.total)?;
    Ok((refresh_tag, path))
}

/// EF(ACRules): `SEQUENCE { aidRef CHOICE, conditionsPath Path }` per rule.
pub fn parse_ac_rules(bytes: &[u8]) -> SeResult<Vec<(AidRef, PathAttributes)>> {
    let mut rules = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == 0x00 || bytes[pos] == 0xFF {
            pos += 1;
            continue;
        }
        let rule = tlv::decode_sequence(bytes, pos)?;
        pos += rule.total;
        let body = rule.value(bytes);

        let head = tlv::parse_next(body, 0)?;
        let (aid_ref, path_pos) = decode_aid_ref(body, &head)?;
        let (path, _) = tlv::parse_path_attributes(body, path_pos)?;
        rules.push((aid_ref, path));
    }
    Ok(rules)
}

fn decode_aid_ref(
    body: &[u8],
    head: &tlv::TlvEntry,
) -> SeResult<(AidRef, usize)> {
    match head.tag {
        // Some encoders wrap the AID-REF-DO in an A0 carrier.
        TAG_AID_REF_CARRIER => {
            let inner = tlv::parse_next(body, head.value_offset)?;
            let (aid_ref, _) = decode_aid_ref(&body[..head.value_offset + head.length], &inner)?;
            Ok((aid_ref, head.total))
        },
        TAG_AID => {
            let value = head.value(body);
            let aid_ref = if value.is_empty() {
                AidRef::All
            } else {
                AidRef::Specific(value.to_vec())
            };
            Ok((aid_ref, head.total))
        },
        TAG_AID_REF_DEFAULT | TAG_RULES_FOR_DEFAULT => Ok((AidRef::Default, head.total)),
        TAG_RULES_FOR_ALL => Ok((AidRef::All, head.total)),
        _ => Err(malformed("AID-REF-DO choice", 0)),
    }
}

/// One decoded EF(ACConditions) entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionEntry {
    pub hash: HashRef,
    pub access: ChannelAccess,
}

/// EF(ACConditions): a list of `SEQUENCE { certHash OCTET STRING OPTIONAL,
/// accessRules [0] OPTIONAL }`.
///
/// An empty condition body denies; a certificate hash without further
/// constraints grants APDU and NFC access outright.
pub fn parse_ac_conditions(bytes: &[u8]) -> SeResult<Vec<ConditionEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == 0x00 || bytes[pos] == 0xFF {
            pos += 1;
            continue;
        }
        let condition = tlv::decode_sequence(bytes, pos)?;
        pos += condition.total;
        let body = condition.value(bytes);

        if body.is_empty() {
            entries.push(ConditionEntry {
                hash: HashRef::Any,
                access: ChannelAccess::denied("empty access condition"),
            });
            continue;
        }

        let mut cursor = 0;
        let mut hash = HashRef::Any;
        if body[cursor] == tlv::TAG_OCTET_STRING {
            let (raw, entry) = tlv::decode_octet_string(body, cursor)?;
            hash = HashRef::from_bytes(raw)?;
            cursor += entry.total;
        }

        let mut access = ChannelAccess::allowed("access rule");
        if cursor < body.len() {
            let rules = tlv::expect_tag(body, cursor, TAG_ACCESS_RULES, "[0] AccessRules")?;
            apply_access_rules(rules.value(body), &mut access)?;
        }
        entries.push(ConditionEntry { hash, access });
    }
    Ok(entries)
}

fn apply_access_rules(rules: &[u8], access: &mut ChannelAccess) -> SeResult<()> {
    let mut pos = 0;
    while pos < rules.len() {
        let rule = tlv::parse_next(rules, pos)?;
        let body = rule.value(rules);
        match rule.tag {
            TAG_APDU_RULE => {
                let choice = tlv::parse_next(body, 0)?;
                match choice.tag {
                    TAG_PERMISSION => {
                        access.apdu_access = decode_permission(choice.value(body));
                    },
                    TAG_FILTER_LIST => {
                        access.use_apdu_filter = true;
                        access.apdu_filters = decode_filters(choice.value(body))?;
                        access.apdu_access = AccessDecision::Allowed;
                    },
                    _ => return Err(malformed("APDU rule choice", pos)),
                }
            },
            TAG_NFC_RULE => {
                let choice = tlv::expect_tag(body, 0, TAG_PERMISSION, "NFC permission")?;
                access.nfc_event_access = decode_permission(choice.value(body));
            },
            _ => return Err(malformed("access rule choice", pos)),
        }
        pos += rule.total;
    }
    Ok(())
}

fn decode_permission(value: &[u8]) -> AccessDecision {
    match value.first() {
        Some(&0x00) => AccessDecision::Denied,
        Some(_) => AccessDecision::Allowed,
        None => AccessDecision::Undefined,
    }
}

fn decode_filters(list: &[u8]) -> SeResult<Vec<ApduFilter>> {
    let mut filters = Vec::new();
    let mut pos = 0;
    while pos < list.len() {
        let (raw, entry) = tlv::decode_octet_string(list, pos)?;
        if raw.len() != 8 {
            return Err(malformed("8-byte APDU filter", entry.value_offset));
        }
        let mut header = [0u8; 4];
        let mut mask = [0u8; 4];
        header.copy_from_slice(&raw[..4]);
        mask.copy_from_slice(&raw[4..]);
        filters.push(ApduFilter::new(header, mask));
        pos += entry.total;
    }
    Ok(filters)
}

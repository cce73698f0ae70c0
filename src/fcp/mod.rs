// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! File Control Parameter decoding.
//!
//! SELECT with P2=04 answers with an ISO 7816-4 FCP template (tag `62`).
//! Legacy SIMs (TS 51.011) instead answer GET RESPONSE with a fixed byte
//! layout. Both decode into the same [`FileInfo`].

use crate::tlv::{self, TlvError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    Df,
    Ef,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileStructure {
    NoEf,
    Transparent,
    LinearFixed,
    LinearVariable,
    Cyclic,
    #[default]
    Unknown,
}

/// ISO 7816-4 life cycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifeCycle {
    #[default]
    NoInformation,
    Creation,
    Initialization,
    OperationalActivated,
    OperationalDeactivated,
    Termination,
    Unknown,
}

const TAG_FCP_TEMPLATE: u8 = 0x62;
const TAG_FILE_SIZE: u8 = 0x80;
const TAG_TOTAL_FILE_SIZE: u8 = 0x81;
const TAG_FILE_DESCRIPTOR: u8 = 0x82;
const TAG_FILE_ID: u8 = 0x83;
const TAG_SFI: u8 = 0x88;
const TAG_LIFE_CYCLE: u8 = 0x8A;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileInfo {
    pub file_type: FileType,
    pub structure: FileStructure,
    pub file_size: Option<usize>,
    pub total_file_size: Option<usize>,
    pub fid: Option<u16>,
    /// 1..=30 when the card reports one.
    pub sfi: Option<u8>,
    pub max_record_size: Option<usize>,
    pub number_of_records: Option<usize>,
    pub lcs: LifeCycle,
}

impl FileInfo {
    /// Decodes either a modern FCP template or a legacy TS 51.011 GET
    /// RESPONSE image.
    pub fn parse(raw: &[u8]) -> Result<Self, TlvError> {
        match raw.first() {
            Some(&TAG_FCP_TEMPLATE) => Self::parse_fcp(raw),
            Some(_) if raw.len() >= 15 => Ok(Self::parse_legacy(raw)),
            _ => Err(TlvError::Malformed {
                expected: "FCP template or TS 51.011 layout",
                at_offset: 0,
            }),
        }
    }

    fn parse_fcp(raw: &[u8]) -> Result<Self, TlvError> {
        let template = tlv::expect_tag(raw, 0, TAG_FCP_TEMPLATE, "FCP template")?;
        let body = template.value(raw);

        let mut info = FileInfo::default();
        let mut pos = 0;
        while pos < body.len() {
            let entry = tlv::parse_next(body, pos)?;
            let value = entry.value(body);
            match entry.tag {
                TAG_FILE_SIZE => info.file_size = Some(be_usize(value)),
                TAG_TOTAL_FILE_SIZE => info.total_file_size = Some(be_usize(value)),
                TAG_FILE_DESCRIPTOR => info.apply_descriptor(value),
                TAG_FILE_ID => {
                    if value.len() == 2 {
                        info.fid = Some(u16::from_be_bytes([value[0], value[1]]));
                    }
                },
                TAG_SFI => info.sfi = decode_sfi(value),
                TAG_LIFE_CYCLE => {
                    if let Some(&b) = value.first() {
                        info.lcs = decode_lcs(b);
                    }
                },
                // Proprietary / security tags are irrelevant here.
                _ => {},
            }
            pos += entry.total;
        }
        Ok(info)
    }

    fn apply_descriptor(&mut self, value: &[u8]) {
        let Some(&descriptor) = value.first() else {
            return;
        };
        if descriptor & 0x38 == 0x38 {
            self.file_type = FileType::Df;
            self.structure = FileStructure::NoEf;
            return;
        }
        self.file_type = FileType::Ef;
        self.structure = match descriptor & 0x07 {
            0 => FileStructure::NoEf,
            1 => FileStructure::Transparent,
            2 | 3 => FileStructure::LinearFixed,
            4 | 5 => FileStructure::LinearVariable,
            6 | 7 => FileStructure::Cyclic,
            _ => FileStructure::Unknown,
        };
        // Record-based files append record size and count (ETSI TS 102 222).
        if value.len() >= 4 {
            self.max_record_size =
                Some(u16::from_be_bytes([value[2], value[3]]) as usize);
        }
        if value.len() >= 5 {
            self.number_of_records = Some(value[4] as usize);
        }
    }

    /// TS 51.011 § 9.2.1 fixed layout.
    fn parse_legacy(raw: &[u8]) -> Self {
        let file_size = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        let structure = match raw[13] {
            0x00 => FileStructure::Transparent,
            0x01 => FileStructure::LinearFixed,
            0x03 => FileStructure::Cyclic,
            _ => FileStructure::Unknown,
        };
        let record = raw[14] as usize;
        let record_based = record > 0 && structure != FileStructure::Transparent;
        FileInfo {
            file_type: match raw[6] {
                0x01 | 0x02 => FileType::Df,
                0x04 => FileType::Ef,
                _ => FileType::Unknown,
            },
            structure,
            file_size: Some(file_size),
            fid: Some(u16::from_be_bytes([raw[4], raw[5]])),
            max_record_size: record_based.then_some(record),
            number_of_records: record_based.then_some(file_size / record),
            ..FileInfo::default()
        }
    }
}

fn be_usize(value: &[u8]) -> usize {
    value.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize)
}

/// GSM 102 222 SFI coding: low 3 bits must be zero, SFI in the upper 5.
fn decode_sfi(value: &[u8]) -> Option<u8> {
    match value {
        [b] if b & 0x07 == 0 => {
            let sfi = b >> 3;
            (1..=30).contains(&sfi).then_some(sfi)
        },
        _ => None,
    }
}

fn decode_lcs(b: u8) -> LifeCycle {
    match b {
        0 => LifeCycle::NoInformation,
        1 => LifeCycle::Creation,
        3 => LifeCycle::Initialization,
        5 | 7 => LifeCycle::OperationalActivated,
        4 | 6 => LifeCycle::OperationalDeactivated,
        12..=15 => LifeCycle::Termination,
        _ => LifeCycle::Unknown,
    }
}

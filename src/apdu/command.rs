// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Command APDU: building, wire encoding and decoding.
//!
//! The four ISO cases and both length encodings are supported:
//!
//! ```text
//! case 1:  CLA INS P1 P2
//! case 2s: CLA INS P1 P2 Le            (Le 1..=256, 00 = 256)
//! case 3s: CLA INS P1 P2 Lc data       (Lc 1..=255)
//! case 4s: CLA INS P1 P2 Lc data Le
//! case 2e: CLA INS P1 P2 00 LeH LeL    (Le 1..=65536, 0000 = 65536)
//! case 3e: CLA INS P1 P2 00 LcH LcL data
//! case 4e: CLA INS P1 P2 00 LcH LcL data LeH LeL
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    apdu::cla,
    error::{SeError, SeResult},
};

/// Instruction bytes the middleware itself emits or inspects.
pub mod ins {
    pub const SELECT: u8 = 0xA4;
    pub const READ_BINARY: u8 = 0xB0;
    pub const UPDATE_BINARY: u8 = 0xD6;
    pub const READ_RECORD: u8 = 0xB2;
    pub const UPDATE_RECORD: u8 = 0xDC;
    pub const APPEND_RECORD: u8 = 0xE2;
    pub const SEARCH_RECORD: u8 = 0xA2;
    pub const GET_RESPONSE: u8 = 0xC0;
    pub const ENVELOPE: u8 = 0xC2;
    pub const MANAGE_CHANNEL: u8 = 0x70;
    pub const VERIFY: u8 = 0x20;
    pub const CHANGE_REFERENCE_DATA: u8 = 0x24;
    pub const DISABLE_VERIFICATION: u8 = 0x26;
    pub const ENABLE_VERIFICATION: u8 = 0x28;
    pub const RESET_RETRY_COUNTER: u8 = 0x2C;
}

/// SELECT P1 selection modes (ISO 7816-4 table 39).
pub mod select_mode {
    pub const BY_FID: u8 = 0x00;
    pub const PARENT_DF: u8 = 0x03;
    pub const BY_DF_NAME: u8 = 0x04;
    pub const PATH_FROM_MF: u8 = 0x08;
    pub const PATH_FROM_CURRENT: u8 = 0x09;
}

const MAX_SHORT_DATA: usize = 255;
const MAX_SHORT_LE: u32 = 256;
const MAX_EXTENDED_DATA: usize = 65_535;
const MAX_EXTENDED_LE: u32 = 65_536;

/// A decoded (or to-be-encoded) command APDU.
///
/// `le` holds the *resolved* expected length: `256` for a short-form `Le=00`,
/// `65536` for an extended-form `Le=0000`.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Bytes,
    pub le: Option<u32>,
}

impl fmt::Debug for CommandApdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandApdu({:02X} {:02X} {:02X} {:02X}, lc={}, le={:?})",
            self.cla,
            self.ins,
            self.p1,
            self.p2,
            self.data.len(),
            self.le
        )
    }
}

impl CommandApdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Bytes::new(),
            le: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Expected response length; `0` means "maximum" and resolves to 256
    /// (short) or 65536 (extended) at encode time depending on the data
    /// length.
    pub fn with_le(mut self, le: u32) -> Self {
        self.le = Some(if le == 0 {
            if self.data.len() > MAX_SHORT_DATA {
                MAX_EXTENDED_LE
            } else {
                MAX_SHORT_LE
            }
        } else {
            le
        });
        self
    }

    /// True when the encoded form needs extended Lc/Le fields.
    pub fn is_extended(&self) -> bool {
        self.data.len() > MAX_SHORT_DATA || self.le.is_some_and(|le| le > MAX_SHORT_LE)
    }

    pub fn encode(&self) -> SeResult<Bytes> {
        if self.data.len() > MAX_EXTENDED_DATA {
            return Err(SeError::Parameter(format!(
                "command data too long: {} > {MAX_EXTENDED_DATA}",
                self.data.len()
            )));
        }
        if let Some(le) = self.le
            && !(1..=MAX_EXTENDED_LE).contains(&le)
        {
            return Err(SeError::Parameter(format!("Le {le} out of range 1..=65536")));
        }

        let mut out = BytesMut::with_capacity(4 + 3 + self.data.len() + 3);
        out.put_u8(self.cla);
        out.put_u8(self.ins);
        out.put_u8(self.p1);
        out.put_u8(self.p2);

        let extended = self.is_extended();
        if !self.data.is_empty() {
            if extended {
                out.put_u8(0x00);
                out.put_u16(self.data.len() as u16);
            } else {
                out.put_u8(self.data.len() as u8);
            }
            out.put_slice(&self.data);
        }
        if let Some(le) = self.le {
            if extended {
                if self.data.is_empty() {
                    out.put_u8(0x00);
                }
                out.put_u16(if le == MAX_EXTENDED_LE { 0 } else { le as u16 });
            } else {
                out.put_u8(if le == MAX_SHORT_LE { 0 } else { le as u8 });
            }
        }
        Ok(out.freeze())
    }

    /// Decodes a raw command, accepting every case/length combination that
    /// [`CommandApdu::encode`] can produce.
    pub fn parse(raw: &[u8]) -> SeResult<Self> {
        let malformed =
            |what: &str| SeError::Parameter(format!("malformed command APDU: {what}"));

        if raw.len() < 4 {
            return Err(malformed("shorter than a 4-byte header"));
        }
        let head = Self::new(raw[0], raw[1], raw[2], raw[3]);
        let body = &raw[4..];

        match body.len() {
            0 => Ok(head),
            1 => {
                // Case 2 short; Le=00 means 256.
                let le = if body[0] == 0 { MAX_SHORT_LE } else { body[0] as u32 };
                Ok(Self { le: Some(le), ..head })
            },
            _ if body[0] != 0 => {
                let lc = body[0] as usize;
                let data = Bytes::copy_from_slice(
                    body.get(1..1 + lc).ok_or_else(|| malformed("Lc exceeds body"))?,
                );
                match body.len() - 1 - lc {
                    0 => Ok(Self { data, ..head }),
                    1 => {
                        let le_raw = body[1 + lc];
                        let le =
                            if le_raw == 0 { MAX_SHORT_LE } else { le_raw as u32 };
                        Ok(Self { data, le: Some(le), ..head })
                    },
                    _ => Err(malformed("trailing bytes after case 4 short")),
                }
            },
            _ => {
                // body[0] == 0: extended prefix.
                if body.len() < 3 {
                    return Err(malformed("truncated extended length field"));
                }
                let field = u16::from_be_bytes([body[1], body[2]]) as usize;
                if body.len() == 3 {
                    // Case 2 extended; Le=0000 means 65536.
                    let le = if field == 0 { MAX_EXTENDED_LE } else { field as u32 };
                    return Ok(Self { le: Some(le), ..head });
                }
                let lc = field;
                if lc == 0 {
                    return Err(malformed("extended Lc of zero"));
                }
                let data = Bytes::copy_from_slice(
                    body.get(3..3 + lc).ok_or_else(|| malformed("Lc exceeds body"))?,
                );
                match body.len() - 3 - lc {
                    0 => Ok(Self { data, ..head }),
                    2 => {
                        let le_raw =
                            u16::from_be_bytes([body[3 + lc], body[4 + lc]]) as u32;
                        let le = if le_raw == 0 { MAX_EXTENDED_LE } else { le_raw };
                        Ok(Self { data, le: Some(le), ..head })
                    },
                    _ => Err(malformed("trailing bytes after case 4 extended")),
                }
            },
        }
    }

    /// Splits an extended command into a chained ENVELOPE sequence for
    /// drivers limited to short APDUs. The encoded command travels as the
    /// concatenated ENVELOPE payload; a trailing zero-data ENVELOPE fetches
    /// the response.
    pub fn to_envelopes(&self) -> SeResult<Vec<CommandApdu>> {
        let encoded = self.encode()?;
        let mut parts: Vec<CommandApdu> = encoded
            .chunks(MAX_SHORT_DATA)
            .map(|chunk| {
                CommandApdu::new(self.cla, ins::ENVELOPE, 0x00, 0x00)
                    .with_data(Bytes::copy_from_slice(chunk))
            })
            .collect();
        parts.push(CommandApdu::new(self.cla, ins::ENVELOPE, 0x00, 0x00).with_le(0));
        Ok(parts)
    }
}

/// Commands the client-facing transmit path must never forward: MANAGE
/// CHANNEL would desynchronize the engine's channel table, SELECT by DF name
/// would bypass the access-control decision made at channel-open time.
///
/// SELECT by DF name is rejected regardless of the command class; the
/// interindustry pattern only qualifies the MANAGE CHANNEL check.
pub fn is_forbidden(raw: &[u8]) -> bool {
    if raw.len() < 4 {
        return false;
    }
    if raw[1] == ins::SELECT && raw[2] == select_mode::BY_DF_NAME {
        return true;
    }
    raw[1] == ins::MANAGE_CHANNEL && cla::is_interindustry(raw[0])
}

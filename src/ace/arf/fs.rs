// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! On-card file access for the rule loader.
//!
//! Two transports exist: the SIMalliance way (a logical channel to the
//! PKCS#15 ADF, plain SELECT + READ BINARY/RECORD) and the legacy SIM-IO
//! path through the telephony stack. Both are driven under one exclusive
//! terminal guard so a rule load is atomic with respect to client traffic.

use bytes::Bytes;
use hex_literal::hex;

use crate::{
    apdu::{CommandApdu, cla, command::ins, command::select_mode},
    error::{SeError, SeResult, sw_error},
    fcp::{FileInfo, FileStructure},
    terminal::{SimIoRequest, TerminalExclusive, exchange},
};

pub const PKCS15_AID: [u8; 12] = hex!("A000000063504B43532D3135");
pub const GPAC_AID: [u8; 12] = hex!("A000000018475041432D3135");

pub const FID_MF: u16 = 0x3F00;
pub const FID_EF_DIR: u16 = 0x2F00;
pub const FID_EF_ODF: u16 = 0x5031;
pub const FID_EF_TOKEN_INFO: u16 = 0x5032;

/// OID naming the access-control data object in EF(DODF).
pub const AC_OID: &str = "1.2.840.114283.200.1.1";

/// How the loader reaches the rule files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArfMode {
    /// Logical channel to the PKCS#15 / GPAC ADF.
    SimAlliance,
    /// Legacy SIM-IO file reads.
    SimIo,
}

/// File reader over one of the two transports.
pub enum ArfFs<'a> {
    Channel {
        io: &'a TerminalExclusive<'a>,
        channel: u8,
    },
    SimIo {
        io: &'a TerminalExclusive<'a>,
    },
}

impl ArfFs<'_> {
    /// Selects a file and returns its decoded description: the FCP template
    /// on a logical channel, the TS 51.011 GET RESPONSE image over SIM-IO.
    pub fn select(&self, fids: &[u16]) -> SeResult<FileInfo> {
        match self {
            ArfFs::Channel { io, channel } => {
                let (p1, path) = select_coordinates(fids)?;
                let resp = exchange::exchange(
                    io,
                    &CommandApdu::new(cla::set_channel(0x00, *channel)?, ins::SELECT, p1, 0x04)
                        .with_data(path)
                        .with_le(0),
                )?;
                if !resp.class().is_select_success() {
                    return Err(sw_error(resp.sw()));
                }
                if resp.data().is_empty() {
                    return Ok(FileInfo::default());
                }
                Ok(FileInfo::parse(resp.data())?)
            },
            ArfFs::SimIo { io } => {
                let (fid, path) = sim_io_coordinates(fids)?;
                let resp = io.sim_io_exchange(
                    fid,
                    &path,
                    SimIoRequest {
                        ins: ins::GET_RESPONSE,
                        p1: 0,
                        p2: 0,
                        p3: 0,
                        data: Bytes::new(),
                    },
                )?;
                let resp = crate::apdu::ResponseApdu::parse(&resp)?;
                if !resp.class().is_ok() {
                    return Err(sw_error(resp.sw()));
                }
                Ok(FileInfo::parse(resp.data())?)
            },
        }
    }

    /// Reads a transparent file in full.
    pub fn read_file(&self, fids: &[u16]) -> SeResult<Vec<u8>> {
        match self {
            ArfFs::Channel { io, channel } => {
                let info = self.select(fids)?;
                let size = info.file_size.unwrap_or(0);
                let mut out = Vec::with_capacity(size);
                loop {
                    let offset = out.len();
                    if size > 0 && offset >= size {
                        break;
                    }
                    let wanted = if size > 0 { (size - offset).min(256) } else { 256 };
                    let resp = exchange::exchange(
                        io,
                        &CommandApdu::new(
                            cla::set_channel(0x00, *channel)?,
                            ins::READ_BINARY,
                            (offset >> 8) as u8,
                            offset as u8,
                        )
                        .with_le(wanted as u32),
                    )?;
                    if !resp.class().is_ok() {
                        return Err(sw_error(resp.sw()));
                    }
                    if resp.data().is_empty() {
                        break;
                    }
                    out.extend_from_slice(resp.data());
                    if resp.data().len() < wanted || size == 0 {
                        break;
                    }
                }
                Ok(out)
            },
            ArfFs::SimIo { io } => {
                let (fid, path) = sim_io_coordinates(fids)?;
                let resp = io.sim_io_exchange(
                    fid,
                    &path,
                    SimIoRequest {
                        ins: ins::READ_BINARY,
                        p1: 0,
                        p2: 0,
                        p3: 0,
                        data: Bytes::new(),
                    },
                )?;
                let resp = crate::apdu::ResponseApdu::parse(&resp)?;
                if !resp.class().is_ok() {
                    return Err(sw_error(resp.sw()));
                }
                Ok(resp.data().to_vec())
            },
        }
    }

    /// Reads every record of a linear-fixed file.
    pub fn read_records(&self, fids: &[u16]) -> SeResult<Vec<Vec<u8>>> {
        match self {
            ArfFs::Channel { io, channel } => {
                let info = self.select(fids)?;
                if info.structure == FileStructure::Transparent {
                    return Err(SeError::Parameter(
                        "record read on a transparent file".into(),
                    ));
                }
                let count = info.number_of_records.unwrap_or(254);
                let mut records = Vec::new();
                for number in 1..=count {
                    let resp = exchange::exchange(
                        io,
                        &CommandApdu::new(
                            cla::set_channel(0x00, *channel)?,
                            ins::READ_RECORD,
                            number as u8,
                            0x04,
                        )
                        .with_le(info.max_record_size.map_or(0, |s| s as u32)),
                    )?;
                    match resp.class() {
                        c if c.is_ok() => records.push(resp.data().to_vec()),
                        crate::apdu::sw::SwClass::RecordNotFound => break,
                        _ => return Err(sw_error(resp.sw())),
                    }
                }
                Ok(records)
            },
            ArfFs::SimIo { io } => {
                let info = self.select(fids)?;
                let Some(rec_size) = info.max_record_size else {
                    return Err(SeError::Parameter(
                        "record read on a transparent file".into(),
                    ));
                };
                let count = info.number_of_records.unwrap_or(0);
                let (fid, path) = sim_io_coordinates(fids)?;
                let mut records = Vec::with_capacity(count);
                for number in 1..=count {
                    let resp = io.sim_io_exchange(
                        fid,
                        &path,
                        SimIoRequest {
                            ins: ins::READ_RECORD,
                            p1: number as u8,
                            p2: 0x04,
                            p3: rec_size as u8,
                            data: Bytes::new(),
                        },
                    )?;
                    let resp = crate::apdu::ResponseApdu::parse(&resp)?;
                    if !resp.class().is_ok() {
                        return Err(sw_error(resp.sw()));
                    }
                    records.push(resp.data().to_vec());
                }
                Ok(records)
            },
        }
    }
}

/// SELECT mode and payload for a path: a single FID selects directly, an
/// absolute path walks from the MF (which itself is never part of the
/// payload), everything else walks from the current DF.
fn select_coordinates(fids: &[u16]) -> SeResult<(u8, Vec<u8>)> {
    let encode = |fids: &[u16]| {
        fids.iter().flat_map(|fid| fid.to_be_bytes()).collect::<Vec<u8>>()
    };
    match fids {
        [] => Err(SeError::Parameter("empty file path".into())),
        [fid] => Ok((select_mode::BY_FID, encode(&[*fid]))),
        [FID_MF, rest @ ..] => Ok((select_mode::PATH_FROM_MF, encode(rest))),
        _ => Ok((select_mode::PATH_FROM_CURRENT, encode(fids))),
    }
}

fn sim_io_coordinates(fids: &[u16]) -> SeResult<(u16, Vec<u8>)> {
    let fid = *fids
        .last()
        .ok_or_else(|| SeError::Parameter("empty file path".into()))?;
    let path = fids[..fids.len() - 1]
        .iter()
        .flat_map(|fid| fid.to_be_bytes())
        .collect();
    Ok((fid, path))
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! ISO file-system access over an open channel.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    apdu::{
        CommandApdu, ResponseApdu,
        command::{ins, select_mode},
    },
    error::{SeError, SeResult, sw_error},
    fcp::FileInfo,
    service::{Channel, ClientContext},
};

/// What to select, unified over the two addressing directions of the
/// source protocol plus parent traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSelector {
    Fid(u16),
    /// Absolute when it starts with `3F00`, relative to the current DF
    /// otherwise.
    Path(Vec<u16>),
    Parent,
}

const MAX_READ_CHUNK: usize = 256;
const MAX_WRITE_CHUNK: usize = 255;
/// READ/UPDATE BINARY carry a 15-bit offset.
const MAX_OFFSET: usize = 0x7FFF;

pub struct FileViewProvider {
    channel: Arc<Channel>,
    ctx: ClientContext,
    /// FCP of the last selected file; sizes for "read to end" come from
    /// here.
    current: Mutex<Option<FileInfo>>,
}

impl FileViewProvider {
    pub fn new(channel: Arc<Channel>, ctx: ClientContext) -> Self {
        Self {
            channel,
            ctx,
            current: Mutex::new(None),
        }
    }

    fn transmit(&self, cmd: &CommandApdu) -> SeResult<ResponseApdu> {
        let raw = cmd.encode()?;
        let reply = self.channel.transmit(&self.ctx, &raw)?;
        ResponseApdu::parse(&reply)
    }

    /// Selects a file and decodes its FCP.
    pub fn select(&self, selector: FileSelector) -> SeResult<FileInfo> {
        let (p1, data) = match selector {
            FileSelector::Fid(fid) => {
                (select_mode::BY_FID, fid.to_be_bytes().to_vec())
            },
            FileSelector::Path(fids) if fids.is_empty() => {
                return Err(SeError::Parameter("empty selection path".into()));
            },
            FileSelector::Path(fids) => {
                let (p1, fids) = if fids[0] == 0x3F00 {
                    (select_mode::PATH_FROM_MF, &fids[1..])
                } else {
                    (select_mode::PATH_FROM_CURRENT, &fids[..])
                };
                (
                    p1,
                    fids.iter().flat_map(|fid| fid.to_be_bytes()).collect(),
                )
            },
            FileSelector::Parent => (select_mode::PARENT_DF, Vec::new()),
        };

        let mut cmd = CommandApdu::new(0x00, ins::SELECT, p1, 0x04).with_le(0);
        if !data.is_empty() {
            cmd = cmd.with_data(data);
        }
        let resp = self.transmit(&cmd)?;
        if !resp.class().is_select_success() {
            return Err(sw_error(resp.sw()));
        }

        let info = if resp.data().is_empty() {
            FileInfo::default()
        } else {
            FileInfo::parse(resp.data())?
        };
        *self.current.lock() = Some(info.clone());
        Ok(info)
    }

    /// FCP of the currently selected file, if any.
    pub fn current_file(&self) -> Option<FileInfo> {
        self.current.lock().clone()
    }

    /// Reads `length` bytes starting at `offset`; a zero `length` reads to
    /// the end of the selected file.
    pub fn read_binary(&self, offset: usize, length: usize) -> SeResult<Vec<u8>> {
        if offset > MAX_OFFSET {
            return Err(SeError::Parameter(format!(
                "offset {offset} exceeds {MAX_OFFSET}"
            )));
        }
        let length = if length == 0 {
            let size = self
                .current
                .lock()
                .as_ref()
                .and_then(|info| info.file_size)
                .ok_or_else(|| {
                    SeError::Parameter(
                        "length 0 needs a selected file with a known size".into(),
                    )
                })?;
            size.saturating_sub(offset)
        } else {
            length
        };

        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let at = offset + out.len();
            let wanted = (length - out.len()).min(MAX_READ_CHUNK);
            let resp = self.transmit(
                &CommandApdu::new(
                    0x00,
                    ins::READ_BINARY,
                    (at >> 8) as u8,
                    at as u8,
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
            if resp.data().len() < wanted {
                break;
            }
        }
        Ok(out)
    }

    pub fn update_binary(&self, offset: usize, data: &[u8]) -> SeResult<()> {
        if offset > MAX_OFFSET {
            return Err(SeError::Parameter(format!(
                "offset {offset} exceeds {MAX_OFFSET}"
            )));
        }
        for (i, chunk) in data.chunks(MAX_WRITE_CHUNK).enumerate() {
            let at = offset + i * MAX_WRITE_CHUNK;
            let resp = self.transmit(
                &CommandApdu::new(
                    0x00,
                    ins::UPDATE_BINARY,
                    (at >> 8) as u8,
                    at as u8,
                )
                .with_data(Bytes::copy_from_slice(chunk)),
            )?;
            if !resp.class().is_ok() {
                return Err(sw_error(resp.sw()));
            }
        }
        Ok(())
    }

    /// Reads one record by absolute number (1-based).
    pub fn read_record(&self, number: u8) -> SeResult<Vec<u8>> {
        if number == 0 {
            return Err(SeError::Parameter("record numbers start at 1".into()));
        }
        let le = self
            .current
            .lock()
            .as_ref()
            .and_then(|info| info.max_record_size)
            .map_or(0, |s| s as u32);
        let resp = self.transmit(
            &CommandApdu::new(0x00, ins::READ_RECORD, number, 0x04).with_le(le),
        )?;
        if !resp.class().is_ok() {
            return Err(sw_error(resp.sw()));
        }
        Ok(resp.data().to_vec())
    }

    /// Rewrites one record by absolute number. Warning status words count
    /// as success for record writes.
    pub fn update_record(&self, number: u8, data: &[u8]) -> SeResult<()> {
        if number == 0 {
            return Err(SeError::Parameter("record numbers start at 1".into()));
        }
        let resp = self.transmit(
            &CommandApdu::new(0x00, ins::UPDATE_RECORD, number, 0x04)
                .with_data(Bytes::copy_from_slice(data)),
        )?;
        if resp.class().is_select_success() {
            Ok(())
        } else {
            Err(sw_error(resp.sw()))
        }
    }
}

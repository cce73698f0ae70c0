// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory reference terminal.
//!
//! [`MockTerminal`] plays both roles a test needs: a small card emulator
//! (master file + ADFs with transparent and record files, SELECT / READ
//! BINARY / READ RECORD / UPDATE BINARY semantics, logical-channel
//! bookkeeping) and a scripted transport where exact request/response pairs
//! can be queued ahead of the emulation. Every APDU that reaches `transmit`
//! is recorded for assertions.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::{
    apdu::{CommandApdu, cla, command::ins, command::select_mode},
    terminal::{
        OpenChannelResponse, ProviderPermissions, SeEvent, SimIoRequest,
        TerminalDriver, TerminalError, TerminalKind, TerminalProvider,
    },
};

const SW_OK: [u8; 2] = [0x90, 0x00];
const SW_FILE_NOT_FOUND: [u8; 2] = [0x6A, 0x82];
const SW_RECORD_NOT_FOUND: [u8; 2] = [0x6A, 0x83];
const SW_WRONG_P1P2: [u8; 2] = [0x6B, 0x00];
const SW_INS_NOT_SUPPORTED: [u8; 2] = [0x6D, 0x00];
const SW_NOT_ALLOWED: [u8; 2] = [0x69, 0x85];
const SW_FUNC_NOT_SUPPORTED: [u8; 2] = [0x6A, 0x81];

#[derive(Debug, Clone)]
struct EmuFile {
    data: Vec<u8>,
    record_size: Option<usize>,
}

#[derive(Debug, Default, Clone)]
struct CardDir {
    files: HashMap<u16, EmuFile>,
}

#[derive(Debug, Clone)]
struct Adf {
    dir: CardDir,
    select_response: Vec<u8>,
}

#[derive(Debug, Default)]
struct ChannelCtx {
    /// `None` selects against the master file.
    cur_adf: Option<Vec<u8>>,
    selected: Option<u16>,
}

#[derive(Debug, Default)]
struct CardState {
    mf: CardDir,
    adfs: HashMap<Vec<u8>, Adf>,
    channels: BTreeMap<u8, ChannelCtx>,
}

struct Scripted {
    expect: Option<Vec<u8>>,
    reply: Vec<u8>,
}

/// Scriptable in-memory terminal driver.
pub struct MockTerminal {
    state: Mutex<CardState>,
    script: Mutex<VecDeque<Scripted>>,
    transcript: Mutex<Vec<Vec<u8>>>,
    present: AtomicBool,
    atr: Option<Bytes>,
    extended_length: bool,
    max_logical_channels: u8,
    events_tx: Sender<SeEvent>,
    events_rx: Receiver<SeEvent>,
}

impl Default for MockTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTerminal {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        let mut state = CardState::default();
        state.channels.insert(0, ChannelCtx::default());
        Self {
            state: Mutex::new(state),
            script: Mutex::new(VecDeque::new()),
            transcript: Mutex::new(Vec::new()),
            present: AtomicBool::new(true),
            atr: Some(Bytes::from_static(&[0x3B, 0x9F, 0x96, 0x80])),
            extended_length: false,
            max_logical_channels: 3,
            events_tx,
            events_rx,
        }
    }

    pub fn with_extended_length(mut self, supported: bool) -> Self {
        self.extended_length = supported;
        self
    }

    pub fn with_max_logical_channels(mut self, n: u8) -> Self {
        self.max_logical_channels = n;
        self
    }

    // ---- card image construction -------------------------------------

    pub fn add_mf_file(&self, fid: u16, data: Vec<u8>) {
        self.state
            .lock()
            .mf
            .files
            .insert(fid, EmuFile { data, record_size: None });
    }

    pub fn add_mf_record_file(&self, fid: u16, record_size: usize, records: &[Vec<u8>]) {
        self.state
            .lock()
            .mf
            .files
            .insert(fid, record_file(record_size, records));
    }

    pub fn add_adf(&self, aid: &[u8], select_response: Vec<u8>) {
        self.state.lock().adfs.insert(
            aid.to_vec(),
            Adf {
                dir: CardDir::default(),
                select_response,
            },
        );
    }

    pub fn add_adf_file(&self, aid: &[u8], fid: u16, data: Vec<u8>) {
        if let Some(adf) = self.state.lock().adfs.get_mut(aid) {
            adf.dir.files.insert(fid, EmuFile { data, record_size: None });
        }
    }

    pub fn add_adf_record_file(
        &self,
        aid: &[u8],
        fid: u16,
        record_size: usize,
        records: &[Vec<u8>],
    ) {
        if let Some(adf) = self.state.lock().adfs.get_mut(aid) {
            adf.dir.files.insert(fid, record_file(record_size, records));
        }
    }

    // ---- scripting and inspection ------------------------------------

    /// Queues one exchange ahead of the emulation. With `expect` set, the
    /// incoming APDU must match byte-for-byte.
    pub fn script_exchange(&self, expect: Option<&[u8]>, reply: &[u8]) {
        self.script.lock().push_back(Scripted {
            expect: expect.map(<[u8]>::to_vec),
            reply: reply.to_vec(),
        });
    }

    pub fn transcript(&self) -> Vec<Vec<u8>> {
        self.transcript.lock().clone()
    }

    pub fn transmit_count(&self) -> usize {
        self.transcript.lock().len()
    }

    pub fn clear_transcript(&self) {
        self.transcript.lock().clear();
    }

    pub fn open_channel_count(&self) -> usize {
        // Channel 0 always exists.
        self.state.lock().channels.len() - 1
    }

    pub fn set_card_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    pub fn inject_event(&self, event: SeEvent) {
        let _ = self.events_tx.send(event);
    }

    // ---- emulation ---------------------------------------------------

    fn ensure_present(&self) -> Result<(), TerminalError> {
        if self.present.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TerminalError::Io("no secure element present".into()))
        }
    }

    fn emulate(&self, cmd: &CommandApdu) -> Vec<u8> {
        let channel = cla::channel_of(cmd.cla);
        let mut state = self.state.lock();
        if !state.channels.contains_key(&channel) {
            return SW_NOT_ALLOWED.to_vec();
        }

        match cmd.ins {
            ins::SELECT => select(&mut state, channel, cmd),
            ins::READ_BINARY => read_binary(&state, channel, cmd),
            ins::UPDATE_BINARY => update_binary(&mut state, channel, cmd),
            ins::READ_RECORD => read_record(&state, channel, cmd),
            ins::GET_RESPONSE => SW_NOT_ALLOWED.to_vec(),
            _ => SW_INS_NOT_SUPPORTED.to_vec(),
        }
    }
}

/// TS 51.011 § 9.2.1 GET RESPONSE image, the file description the SIM-IO
/// path serves instead of an FCP template.
fn legacy_file_info(fid: u16, file: &EmuFile) -> Vec<u8> {
    let mut out = vec![0u8; 15];
    out[2..4].copy_from_slice(&(file.data.len() as u16).to_be_bytes());
    out[4..6].copy_from_slice(&fid.to_be_bytes());
    // Type of file: EF.
    out[6] = 0x04;
    // Length of the structure-specific trailer.
    out[12] = 0x02;
    if let Some(rec) = file.record_size {
        out[13] = 0x01;
        out[14] = rec as u8;
    }
    out
}

fn record_file(record_size: usize, records: &[Vec<u8>]) -> EmuFile {
    let mut data = Vec::with_capacity(record_size * records.len());
    for rec in records {
        let mut padded = rec.clone();
        padded.resize(record_size, 0xFF);
        data.extend_from_slice(&padded);
    }
    EmuFile { data, record_size: Some(record_size) }
}

fn dir_of<'a>(state: &'a CardState, channel: u8) -> Option<&'a CardDir> {
    let ctx = state.channels.get(&channel)?;
    match &ctx.cur_adf {
        Some(aid) => state.adfs.get(aid).map(|a| &a.dir),
        None => Some(&state.mf),
    }
}

fn selected_file<'a>(state: &'a CardState, channel: u8) -> Option<&'a EmuFile> {
    let fid = state.channels.get(&channel)?.selected?;
    dir_of(state, channel)?.files.get(&fid)
}

fn build_fcp(fid: u16, file: &EmuFile) -> Vec<u8> {
    fn put(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
        out.push(tag);
        out.push(value.len() as u8);
        out.extend_from_slice(value);
    }

    let mut body = Vec::new();
    put(&mut body, 0x80, &(file.data.len() as u16).to_be_bytes());
    match file.record_size {
        Some(rec) => {
            let count = if rec == 0 { 0 } else { file.data.len() / rec };
            let mut descriptor = vec![0x02, 0x21];
            descriptor.extend_from_slice(&(rec as u16).to_be_bytes());
            descriptor.push(count as u8);
            put(&mut body, 0x82, &descriptor);
        },
        None => put(&mut body, 0x82, &[0x41, 0x21]),
    }
    put(&mut body, 0x83, &fid.to_be_bytes());

    let mut out = Vec::with_capacity(body.len() + 4);
    put(&mut out, 0x62, &body);
    out.extend_from_slice(&SW_OK);
    out
}

fn select(state: &mut CardState, channel: u8, cmd: &CommandApdu) -> Vec<u8> {
    match cmd.p1 {
        select_mode::BY_DF_NAME => {
            let Some(adf) = state.adfs.get(cmd.data.as_ref()) else {
                return SW_FILE_NOT_FOUND.to_vec();
            };
            let reply = adf.select_response.clone();
            if let Some(ctx) = state.channels.get_mut(&channel) {
                ctx.cur_adf = Some(cmd.data.to_vec());
                ctx.selected = None;
            }
            reply
        },
        select_mode::PARENT_DF => {
            if let Some(ctx) = state.channels.get_mut(&channel) {
                ctx.selected = None;
            }
            SW_OK.to_vec()
        },
        select_mode::BY_FID
        | select_mode::PATH_FROM_MF
        | select_mode::PATH_FROM_CURRENT => {
            if cmd.data.len() < 2 || cmd.data.len() % 2 != 0 {
                return SW_WRONG_P1P2.to_vec();
            }
            // The emulated file system is flat per directory: selecting a
            // path resolves to its final component.
            let fid =
                u16::from_be_bytes([cmd.data[cmd.data.len() - 2], cmd.data[cmd.data.len() - 1]]);
            if cmd.p1 == select_mode::PATH_FROM_MF || fid == 0x3F00 {
                if let Some(ctx) = state.channels.get_mut(&channel) {
                    if cmd.p1 == select_mode::BY_FID && fid == 0x3F00 {
                        ctx.cur_adf = None;
                        ctx.selected = None;
                        return SW_OK.to_vec();
                    }
                    ctx.cur_adf = None;
                }
            }
            let Some(dir) = dir_of(state, channel) else {
                return SW_NOT_ALLOWED.to_vec();
            };
            let Some(file) = dir.files.get(&fid) else {
                return SW_FILE_NOT_FOUND.to_vec();
            };
            let reply = if cmd.p2 & 0x04 != 0 {
                build_fcp(fid, file)
            } else {
                SW_OK.to_vec()
            };
            if let Some(ctx) = state.channels.get_mut(&channel) {
                ctx.selected = Some(fid);
            }
            reply
        },
        _ => SW_FUNC_NOT_SUPPORTED.to_vec(),
    }
}

fn read_binary(state: &CardState, channel: u8, cmd: &CommandApdu) -> Vec<u8> {
    if cmd.p1 & 0x80 != 0 {
        // SFI addressing is not emulated.
        return SW_FUNC_NOT_SUPPORTED.to_vec();
    }
    let Some(file) = selected_file(state, channel) else {
        return SW_NOT_ALLOWED.to_vec();
    };
    let offset = u16::from_be_bytes([cmd.p1, cmd.p2]) as usize;
    if offset > file.data.len() {
        return SW_WRONG_P1P2.to_vec();
    }
    let wanted = cmd.le.unwrap_or(256) as usize;
    let end = file.data.len().min(offset + wanted);
    let mut out = file.data[offset..end].to_vec();
    out.extend_from_slice(&SW_OK);
    out
}

fn update_binary(state: &mut CardState, channel: u8, cmd: &CommandApdu) -> Vec<u8> {
    let offset = u16::from_be_bytes([cmd.p1, cmd.p2]) as usize;
    let Some(ctx) = state.channels.get(&channel) else {
        return SW_NOT_ALLOWED.to_vec();
    };
    let Some(fid) = ctx.selected else {
        return SW_NOT_ALLOWED.to_vec();
    };
    let cur_adf = ctx.cur_adf.clone();
    let dir = match cur_adf {
        Some(aid) => match state.adfs.get_mut(&aid) {
            Some(adf) => &mut adf.dir,
            None => return SW_NOT_ALLOWED.to_vec(),
        },
        None => &mut state.mf,
    };
    let Some(file) = dir.files.get_mut(&fid) else {
        return SW_FILE_NOT_FOUND.to_vec();
    };
    if offset + cmd.data.len() > file.data.len() {
        return SW_WRONG_P1P2.to_vec();
    }
    file.data[offset..offset + cmd.data.len()].copy_from_slice(&cmd.data);
    SW_OK.to_vec()
}

fn read_record(state: &CardState, channel: u8, cmd: &CommandApdu) -> Vec<u8> {
    if cmd.p2 & 0x07 != 0x04 {
        // Only absolute addressing is emulated.
        return SW_FUNC_NOT_SUPPORTED.to_vec();
    }
    let Some(file) = selected_file(state, channel) else {
        return SW_NOT_ALLOWED.to_vec();
    };
    let Some(rec_size) = file.record_size else {
        return SW_NOT_ALLOWED.to_vec();
    };
    let number = cmd.p1 as usize;
    if number == 0 || number * rec_size > file.data.len() {
        return SW_RECORD_NOT_FOUND.to_vec();
    }
    let mut out = file.data[(number - 1) * rec_size..number * rec_size].to_vec();
    out.extend_from_slice(&SW_OK);
    out
}

impl TerminalDriver for MockTerminal {
    fn atr(&self) -> Option<Bytes> {
        self.present.load(Ordering::SeqCst).then(|| self.atr.clone()).flatten()
    }

    fn is_card_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    fn open_logical_channel(
        &self,
        aid: Option<&[u8]>,
        _p2: u8,
    ) -> Result<OpenChannelResponse, TerminalError> {
        self.ensure_present()?;
        let mut state = self.state.lock();

        let channel = (1..=self.max_logical_channels)
            .find(|n| !state.channels.contains_key(n))
            .ok_or(TerminalError::MissingResource)?;

        let select_response = match aid {
            Some(aid) => {
                let adf = state
                    .adfs
                    .get(aid)
                    .ok_or(TerminalError::NoSuchElement)?;
                Bytes::from(adf.select_response.clone())
            },
            None => Bytes::from_static(&SW_OK),
        };
        state.channels.insert(
            channel,
            ChannelCtx {
                cur_adf: aid.map(<[u8]>::to_vec),
                selected: None,
            },
        );
        Ok(OpenChannelResponse { channel, select_response })
    }

    fn close_logical_channel(&self, channel: u8) -> Result<(), TerminalError> {
        if channel == 0 {
            return Err(TerminalError::Unsupported("closing the basic channel".into()));
        }
        match self.state.lock().channels.remove(&channel) {
            Some(_) => Ok(()),
            None => Err(TerminalError::Io(format!("channel {channel} is not open"))),
        }
    }

    fn transmit(&self, apdu: &[u8]) -> Result<Bytes, TerminalError> {
        self.ensure_present()?;
        self.transcript.lock().push(apdu.to_vec());

        if let Some(step) = self.script.lock().pop_front() {
            if let Some(expect) = step.expect
                && expect != apdu
            {
                return Err(TerminalError::Io(format!(
                    "scripted exchange mismatch: expected {}, got {}",
                    hex::encode(expect),
                    hex::encode(apdu)
                )));
            }
            return Ok(Bytes::from(step.reply));
        }

        let cmd = CommandApdu::parse(apdu)
            .map_err(|e| TerminalError::Io(format!("unparsable APDU: {e}")))?;
        Ok(Bytes::from(self.emulate(&cmd)))
    }

    fn sim_io_exchange(
        &self,
        file_id: u16,
        _path: &[u8],
        command: SimIoRequest,
    ) -> Result<Bytes, TerminalError> {
        self.ensure_present()?;
        let state = self.state.lock();
        let file = state
            .mf
            .files
            .get(&file_id)
            .ok_or(TerminalError::NoSuchElement)?;
        let mut out = match command.ins {
            ins::GET_RESPONSE => legacy_file_info(file_id, file),
            ins::READ_BINARY => file.data.clone(),
            ins::READ_RECORD => {
                let rec = file
                    .record_size
                    .ok_or_else(|| TerminalError::Io("not a record file".into()))?;
                let number = command.p1 as usize;
                if number == 0 || number * rec > file.data.len() {
                    return Err(TerminalError::NoSuchElement);
                }
                file.data[(number - 1) * rec..number * rec].to_vec()
            },
            other => {
                return Err(TerminalError::Unsupported(format!(
                    "SIM-IO instruction {other:02X}"
                )));
            },
        };
        out.extend_from_slice(&SW_OK);
        Ok(Bytes::from(out))
    }

    fn supports_extended_length(&self) -> bool {
        self.extended_length
    }

    fn events(&self) -> Option<Receiver<SeEvent>> {
        Some(self.events_rx.clone())
    }
}

/// Provider wrapping a pre-built [`MockTerminal`].
pub struct MockProvider {
    kind: TerminalKind,
    permissions: ProviderPermissions,
    terminal: Arc<MockTerminal>,
    fail_connect: bool,
}

impl MockProvider {
    pub fn new(kind: TerminalKind, terminal: Arc<MockTerminal>) -> Self {
        Self {
            kind,
            permissions: ProviderPermissions::BIND_TERMINAL
                | ProviderPermissions::SYSTEM_TERMINAL,
            terminal,
            fail_connect: false,
        }
    }

    pub fn with_permissions(mut self, permissions: ProviderPermissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// Simulates a driver that binds but fails to initialize.
    pub fn failing(mut self) -> Self {
        self.fail_connect = true;
        self
    }
}

impl TerminalProvider for MockProvider {
    fn kind(&self) -> TerminalKind {
        self.kind.clone()
    }

    fn permissions(&self) -> ProviderPermissions {
        self.permissions
    }

    fn connect(&self) -> anyhow::Result<Arc<dyn TerminalDriver>> {
        anyhow::ensure!(!self.fail_connect, "terminal failed to initialize");
        Ok(self.terminal.clone())
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The response post-processing loop.
//!
//! Drivers hand back exactly what the card said; re-driving the card on
//! `6Cxx` (wrong Le), collecting `61xx` continuation data with GET RESPONSE
//! and chaining oversized commands through ENVELOPE is done here, under one
//! exclusive terminal guard so no other channel's APDU can interleave.

use bytes::BytesMut;
use tracing::debug;

use crate::{
    apdu::{CommandApdu, ResponseApdu, command::ins, sw::SwClass},
    error::{SeResult, sw_error},
    terminal::TerminalExclusive,
};

fn transmit_once(io: &TerminalExclusive<'_>, cmd: &CommandApdu) -> SeResult<ResponseApdu> {
    let raw = cmd.encode()?;
    debug!(apdu = %hex::encode(&raw), "SEND");
    let reply = io.transmit(&raw)?;
    debug!(apdu = %hex::encode(&reply), "RECV");
    ResponseApdu::parse(&reply)
}

/// Performs one complete logical exchange: the command, its wrong-Le retry
/// and its GET RESPONSE continuations. The returned response carries the
/// concatenated data and the final status word.
pub fn exchange(io: &TerminalExclusive<'_>, cmd: &CommandApdu) -> SeResult<ResponseApdu> {
    if cmd.is_extended() && !io.supports_extended_length() {
        return exchange_chained(io, cmd);
    }
    let first = transmit_once(io, cmd)?;
    post_process(io, cmd, first)
}

/// ENVELOPE chaining for drivers limited to short APDUs. Intermediate parts
/// must answer `9000`; the terminating zero-data ENVELOPE carries the real
/// response.
fn exchange_chained(
    io: &TerminalExclusive<'_>,
    cmd: &CommandApdu,
) -> SeResult<ResponseApdu> {
    let parts = cmd.to_envelopes()?;
    debug!(parts = parts.len(), "chaining extended command through ENVELOPE");

    let (last, body) = parts.split_last().ok_or_else(|| {
        crate::error::SeError::Fatal("empty ENVELOPE chain".into())
    })?;
    for part in body {
        let resp = transmit_once(io, part)?;
        if !resp.class().is_ok() {
            return Err(sw_error(resp.sw()));
        }
    }
    let first = transmit_once(io, last)?;
    post_process(io, last, first)
}

fn post_process(
    io: &TerminalExclusive<'_>,
    cmd: &CommandApdu,
    mut resp: ResponseApdu,
) -> SeResult<ResponseApdu> {
    // Wrong Le: re-issue the very same command with the length the card
    // asked for.
    if let SwClass::WrongLe(correct) = resp.class() {
        let retry = cmd.clone().with_le(correct as u32);
        resp = transmit_once(io, &retry)?;
    }

    if !matches!(resp.class(), SwClass::GetResponseAvailable(_)) {
        return Ok(resp);
    }

    // 61xx: collect every fragment; the SW of the final chunk is the SW the
    // client observes.
    let mut acc = BytesMut::from(resp.data().as_ref());
    while let SwClass::GetResponseAvailable(le) = resp.class() {
        let get_response =
            CommandApdu::new(cmd.cla, ins::GET_RESPONSE, 0x00, 0x00).with_le(le as u32);
        resp = transmit_once(io, &get_response)?;
        acc.extend_from_slice(resp.data());
    }
    Ok(ResponseApdu::new(acc.freeze(), resp.sw1(), resp.sw2()))
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! PIN management over an open channel (ISO 7816-4 § 11.5).

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    apdu::{CommandApdu, ResponseApdu, command::ins},
    error::{SeError, SeResult, sw_error},
    service::{Channel, ClientContext},
};

const MIN_PIN_LEN: usize = 4;
const MAX_PIN_LEN: usize = 8;

/// Reference data number plus scope. P2 carries the number in bits 1-5 and
/// the local/global scope in bit 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinId {
    id: u8,
    local: bool,
}

impl PinId {
    pub fn new(id: u8, local: bool) -> SeResult<Self> {
        if id > 0x1F {
            return Err(SeError::Parameter(format!(
                "PIN id {id} outside 0..=31"
            )));
        }
        Ok(Self { id, local })
    }

    pub fn p2(&self) -> u8 {
        if self.local { self.id | 0x80 } else { self.id }
    }
}

fn validate_pin(pin: &[u8]) -> SeResult<()> {
    if !(MIN_PIN_LEN..=MAX_PIN_LEN).contains(&pin.len()) {
        return Err(SeError::Parameter(format!(
            "PIN length {} outside {MIN_PIN_LEN}..={MAX_PIN_LEN}",
            pin.len()
        )));
    }
    Ok(())
}

pub struct AuthenticationProvider {
    channel: Arc<Channel>,
    ctx: ClientContext,
}

impl AuthenticationProvider {
    pub fn new(channel: Arc<Channel>, ctx: ClientContext) -> Self {
        Self { channel, ctx }
    }

    fn run(&self, cmd: &CommandApdu) -> SeResult<()> {
        let raw = cmd.encode()?;
        let reply = self.channel.transmit(&self.ctx, &raw)?;
        let resp = ResponseApdu::parse(&reply)?;
        if resp.class().is_ok() {
            Ok(())
        } else {
            // 63Cx surfaces the remaining retries, 6983 a blocked method.
            Err(sw_error(resp.sw()))
        }
    }

    pub fn verify_pin(&self, pin_id: PinId, pin: &[u8]) -> SeResult<()> {
        validate_pin(pin)?;
        self.run(
            &CommandApdu::new(0x00, ins::VERIFY, 0x00, pin_id.p2())
                .with_data(Bytes::copy_from_slice(pin)),
        )
    }

    pub fn change_pin(&self, pin_id: PinId, old_pin: &[u8], new_pin: &[u8]) -> SeResult<()> {
        validate_pin(old_pin)?;
        validate_pin(new_pin)?;
        let mut data = BytesMut::with_capacity(old_pin.len() + new_pin.len());
        data.put_slice(old_pin);
        data.put_slice(new_pin);
        self.run(
            &CommandApdu::new(0x00, ins::CHANGE_REFERENCE_DATA, 0x00, pin_id.p2())
                .with_data(data.freeze()),
        )
    }

    /// Resets the retry counter with the unblock code, optionally setting a
    /// new PIN in the same exchange. P1 encodes which parts are present.
    pub fn reset_pin(
        &self,
        pin_id: PinId,
        unblock_code: &[u8],
        new_pin: Option<&[u8]>,
    ) -> SeResult<()> {
        validate_pin(unblock_code)?;
        let (p1, data) = match new_pin {
            Some(new_pin) => {
                validate_pin(new_pin)?;
                let mut data =
                    BytesMut::with_capacity(unblock_code.len() + new_pin.len());
                data.put_slice(unblock_code);
                data.put_slice(new_pin);
                (0x00, data.freeze())
            },
            None => (0x01, Bytes::copy_from_slice(unblock_code)),
        };
        self.run(
            &CommandApdu::new(0x00, ins::RESET_RETRY_COUNTER, p1, pin_id.p2())
                .with_data(data),
        )
    }

    pub fn enable_pin(&self, pin_id: PinId, pin: &[u8]) -> SeResult<()> {
        validate_pin(pin)?;
        self.run(
            &CommandApdu::new(0x00, ins::ENABLE_VERIFICATION, 0x00, pin_id.p2())
                .with_data(Bytes::copy_from_slice(pin)),
        )
    }

    pub fn disable_pin(&self, pin_id: PinId, pin: &[u8]) -> SeResult<()> {
        validate_pin(pin)?;
        self.run(
            &CommandApdu::new(0x00, ins::DISABLE_VERIFICATION, 0x00, pin_id.p2())
                .with_data(Bytes::copy_from_slice(pin)),
        )
    }
}

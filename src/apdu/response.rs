// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Response APDU: `data(0..n) SW1 SW2`.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    apdu::sw::SwClass,
    error::{SeError, SeResult},
};

#[derive(Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    data: Bytes,
    sw1: u8,
    sw2: u8,
}

impl fmt::Debug for ResponseApdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResponseApdu(data[{}]={}, SW={:04X})",
            self.data.len(),
            hex::encode(&self.data),
            self.sw()
        )
    }
}

impl ResponseApdu {
    pub fn new(data: impl Into<Bytes>, sw1: u8, sw2: u8) -> Self {
        Self { data: data.into(), sw1, sw2 }
    }

    /// Splits a raw driver response into payload and status word.
    pub fn parse(raw: &[u8]) -> SeResult<Self> {
        if raw.len() < 2 {
            return Err(SeError::DriverIo(format!(
                "response shorter than a status word ({} bytes)",
                raw.len()
            )));
        }
        Ok(Self {
            data: Bytes::copy_from_slice(&raw[..raw.len() - 2]),
            sw1: raw[raw.len() - 2],
            sw2: raw[raw.len() - 1],
        })
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn sw1(&self) -> u8 {
        self.sw1
    }

    #[inline]
    pub fn sw2(&self) -> u8 {
        self.sw2
    }

    #[inline]
    pub fn sw(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    #[inline]
    pub fn class(&self) -> SwClass {
        SwClass::classify(self.sw())
    }

    /// Re-assembles the wire form (payload followed by SW1 SW2).
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.data.len() + 2);
        out.put_slice(&self.data);
        out.put_u8(self.sw1);
        out.put_u8(self.sw2);
        out.freeze()
    }
}

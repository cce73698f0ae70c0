// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CLA byte helpers (ISO/IEC 7816-4 § 5.4.1).
//!
//! The class byte carries the logical-channel number in one of two layouts:
//!
//! ```text
//!  7   6   5   4   3   2   1   0      bit position
//! +---+---+---+---+---+---+---+---+
//! | P | . | SM    | .   . | CH    |  first interindustry, channels 0..=3
//! +---+---+---+---+---+---+---+---+
//! | P | 1 | SM| .| CH - 4        |  further interindustry, channels 4..=19
//! +---+---+---+---+---+---+---+---+
//! ```
//!
//! * **P** – proprietary class when set.
//! * bit 6 selects the *further interindustry* layout.

use crate::error::{SeError, SeResult};

bitflags::bitflags! {
    /// Masks of the ISO 7816-4 class byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClaBits: u8 {
        /// Proprietary class marker.
        const PROPRIETARY = 0x80;
        /// Further-interindustry layout marker.
        const FURTHER = 0x40;
        /// Channel field of the first-interindustry layout.
        const CHANNEL_FIRST_MASK = 0x03;
        /// Channel field of the further-interindustry layout.
        const CHANNEL_FURTHER_MASK = 0x0F;
    }
}

/// Channel numbers the engine may allocate: 0 is the basic channel,
/// 1..=19 are logical channels.
pub const MAX_CHANNEL: u8 = 19;

/// Encodes `channel` into `cla`, clearing whatever channel bits were there.
///
/// Channels 0..=3 use the first-interindustry layout (bit 6 forced to 0),
/// channels 4..=19 the further-interindustry layout.
pub fn set_channel(cla: u8, channel: u8) -> SeResult<u8> {
    match channel {
        0..=3 => Ok((cla & 0xBC) | channel),
        4..=MAX_CHANNEL => Ok((cla & 0xB0) | ClaBits::FURTHER.bits() | (channel - 4)),
        _ => Err(SeError::Parameter(format!(
            "channel number {channel} out of range 0..={MAX_CHANNEL}"
        ))),
    }
}

/// Inverse of [`set_channel`].
pub fn channel_of(cla: u8) -> u8 {
    if cla & ClaBits::FURTHER.bits() == 0 {
        cla & ClaBits::CHANNEL_FIRST_MASK.bits()
    } else {
        4 + (cla & ClaBits::CHANNEL_FURTHER_MASK.bits())
    }
}

/// Clears the channel field so that APDU filters match on a canonical header.
pub fn clear_channel(cla: u8) -> u8 {
    if cla & ClaBits::FURTHER.bits() == 0 {
        cla & !ClaBits::CHANNEL_FIRST_MASK.bits()
    } else {
        cla & !ClaBits::CHANNEL_FURTHER_MASK.bits()
    }
}

/// True for the interindustry CLA pattern gating the forbidden-command check.
pub fn is_interindustry(cla: u8) -> bool {
    (cla & 0x80) == 0 && (cla & 0x60) != 0x20
}

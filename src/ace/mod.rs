// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Access Control Enforcer.
//!
//! The on-card access-rule file system (GlobalPlatform SE Access Control,
//! ARF flavour) decides which caller may open a channel to which applet and
//! which APDUs it may send there. This module loads those rules into an
//! in-memory cache and applies them at channel-open and transmit time.

pub mod access;
pub mod arf;
pub mod cache;
pub mod enforcer;

pub use access::{AccessDecision, ApduFilter, ChannelAccess};
pub use cache::{AidRef, HashRef, RuleCache};
pub use enforcer::{ClientProfile, Enforcer};

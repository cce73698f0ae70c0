// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The channel/session engine and its client façade.
//!
//! Ownership is strictly downward: the service owns the registry, the
//! registry owns readers, readers own sessions, sessions own channels.
//! Upward links are weak and exist only for cleanup callbacks. Lock order
//! is reader → channel → terminal; every path below respects it.

pub mod channel;
pub mod client;
pub mod reader;
pub mod registry;
pub mod service;
pub mod session;

pub use channel::Channel;
pub use client::{ClientContext, ClientIdentity, DeathWatch, StaticIdentity};
pub use reader::Reader;
pub use registry::Registry;
pub use service::SeService;
pub use session::Session;

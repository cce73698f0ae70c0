// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Caller identity and client-death notification.

use dashmap::DashMap;
use sha1::{Digest, Sha1};

use crate::{
    ace::ClientProfile,
    error::{SeError, SeResult},
};

/// Identity token accompanying every client-facing call. The engine never
/// trusts a handle alone: the PID recorded at channel-open time must match
/// on each subsequent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientContext {
    pub pid: i32,
}

impl ClientContext {
    pub fn new(pid: i32) -> Self {
        Self { pid }
    }
}

/// Resolves OS-level caller identity into package names and signing
/// certificate digests. The platform integration supplies the real thing;
/// [`StaticIdentity`] serves tests and embedders without a package manager.
pub trait ClientIdentity: Send + Sync {
    fn package_for_pid(&self, pid: i32) -> SeResult<String>;

    /// SHA-1 digests of every certificate the package is signed with,
    /// usually one to three values.
    fn certificate_hashes(&self, package: &str) -> SeResult<Vec<[u8; 20]>>;

    fn profile_for(&self, ctx: &ClientContext) -> SeResult<ClientProfile> {
        let package = self.package_for_pid(ctx.pid)?;
        let hashes = self.certificate_hashes(&package)?;
        Ok(ClientProfile { pid: ctx.pid, package, hashes })
    }
}

/// Deterministic in-memory identity store.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    packages: DashMap<i32, String>,
    hashes: DashMap<String, Vec<[u8; 20]>>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_process(&self, pid: i32, package: &str) {
        self.packages.insert(pid, package.to_string());
    }

    /// Registers a signing certificate; the stored reference is its SHA-1.
    pub fn register_certificate(&self, package: &str, certificate_der: &[u8]) {
        let digest: [u8; 20] = Sha1::digest(certificate_der).into();
        self.hashes.entry(package.to_string()).or_default().push(digest);
    }

    /// Registers a pre-computed certificate digest.
    pub fn register_hash(&self, package: &str, hash: [u8; 20]) {
        self.hashes.entry(package.to_string()).or_default().push(hash);
    }
}

impl ClientIdentity for StaticIdentity {
    fn package_for_pid(&self, pid: i32) -> SeResult<String> {
        self.packages
            .get(&pid)
            .map(|p| p.clone())
            .ok_or_else(|| SeError::SecurityDenied(format!("unknown calling pid {pid}")))
    }

    fn certificate_hashes(&self, package: &str) -> SeResult<Vec<[u8; 20]>> {
        Ok(self
            .hashes
            .get(package)
            .map(|h| h.clone())
            .unwrap_or_default())
    }
}

/// Producer half of the client-death pipeline. The platform binder layer
/// calls [`DeathWatch::notify_died`]; the service drains the receiver on a
/// dedicated thread and closes everything the dead client owned.
#[derive(Debug, Clone)]
pub struct DeathWatch {
    tx: crossbeam_channel::Sender<i32>,
}

impl DeathWatch {
    pub fn new() -> (Self, crossbeam_channel::Receiver<i32>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    pub fn notify_died(&self, pid: i32) {
        let _ = self.tx.send(pid);
    }
}

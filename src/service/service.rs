// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The process-wide façade.
//!
//! One [`SeService`] value is constructed at boot and passed around; there
//! is no global state. The platform IPC layer translates its calls into the
//! methods below and feeds client deaths into the death-watch pipeline.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::Receiver;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    error::{SeError, SeResult},
    service::{
        client::{ClientContext, ClientIdentity},
        reader::Reader,
        registry::Registry,
        session::Session,
    },
    terminal::TerminalProvider,
};

pub struct SeService {
    registry: Registry,
    cfg: Config,
    connected: AtomicBool,
}

impl SeService {
    /// Discovers terminals and brings the service up.
    pub fn new(
        cfg: Config,
        providers: &[Box<dyn TerminalProvider>],
        identity: Arc<dyn ClientIdentity>,
    ) -> Arc<Self> {
        let registry = Registry::discover(providers, &identity, &cfg);
        info!(readers = ?registry.reader_names(), "secure element service up");
        Arc::new(Self {
            registry,
            cfg,
            connected: AtomicBool::new(true),
        })
    }

    fn ensure_connected(&self) -> SeResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SeError::NotConnected("service is shut down".into()))
        }
    }

    /// Reader names in enumeration order.
    pub fn reader_names(&self) -> SeResult<Vec<String>> {
        self.ensure_connected()?;
        Ok(self.registry.reader_names())
    }

    pub fn reader(&self, name: &str) -> SeResult<Arc<Reader>> {
        self.ensure_connected()?;
        self.registry.reader(name)
    }

    /// Convenience: `reader(name)?.open_session(ctx)`.
    pub fn open_session(
        &self,
        reader_name: &str,
        ctx: &ClientContext,
    ) -> SeResult<Arc<Session>> {
        self.reader(reader_name)?.open_session(ctx)
    }

    /// Consumes death notifications until the sender side disappears.
    pub fn spawn_death_watch(
        self: &Arc<Self>,
        died: Receiver<i32>,
    ) -> thread::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        thread::Builder::new()
            .name("se-death-watch".into())
            .spawn(move || {
                while let Ok(pid) = died.recv() {
                    match weak.upgrade() {
                        Some(service) => service.client_died(pid),
                        None => break,
                    }
                }
                debug!("death watch stopped");
            })
            .unwrap_or_else(|e| {
                warn!(error = %e, "death watch not started");
                thread::spawn(|| {})
            })
    }

    /// Releases everything a dead client held, reader by reader.
    pub fn client_died(&self, pid: i32) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        info!(pid, "client died, cleaning up");
        for reader in self.registry.readers() {
            reader.client_died(pid);
        }
    }

    /// Closes every session, unbinds drivers and clears caches. Idempotent.
    pub fn shutdown(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("secure element service shutting down");
            self.registry.shutdown();
        }
    }

    /// Diagnostic dump; only served when the `debug` flag is configured.
    pub fn dump(&self) -> SeResult<String> {
        self.ensure_connected()?;
        if !self.cfg.debug {
            return Err(SeError::UnsupportedOperation(
                "diagnostic dump is disabled".into(),
            ));
        }
        let doc = json!({
            "readers": self
                .registry
                .readers()
                .iter()
                .map(|r| r.dump())
                .collect::<Vec<_>>(),
        });
        serde_json::to_string_pretty(&doc)
            .map_err(|e| SeError::Fatal(format!("dump serialization: {e}")))
    }
}

impl std::fmt::Debug for SeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeService")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("registry", &self.registry)
            .finish()
    }
}

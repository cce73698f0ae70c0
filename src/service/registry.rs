// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Terminal discovery and the reader name space.
//!
//! Providers are validated (declared permissions), bound, given canonical
//! names (`SIM1`, `eSE1`, `SD1`, ...) and enumerated in a fixed order:
//! every SIM reader first, then eSE, then SD, then everything else in
//! insertion order. A provider that binds but fails to initialize still
//! becomes a reader; it just never reports a card.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::{
    ace::Enforcer,
    cfg::config::Config,
    error::{SeError, SeResult},
    service::{client::ClientIdentity, reader::Reader},
    terminal::{
        DeadTerminal, ProviderPermissions, TerminalDriver, TerminalHandle, TerminalKind,
        TerminalProvider,
    },
};

pub struct Registry {
    /// Enumeration order.
    readers: Vec<Arc<Reader>>,
    by_name: DashMap<String, Arc<Reader>>,
}

impl Registry {
    /// Probes every provider and builds the reader table.
    pub fn discover(
        providers: &[Box<dyn TerminalProvider>],
        identity: &Arc<dyn ClientIdentity>,
        cfg: &Config,
    ) -> Self {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut discovered: Vec<(TerminalKind, Arc<Reader>)> = Vec::new();

        for provider in providers {
            let kind = provider.kind();
            if !validate(provider.as_ref(), &kind) {
                continue;
            }

            let index = counts.entry(kind.prefix().to_string()).or_insert(0);
            *index += 1;
            let name = format!("{}{}", kind.prefix(), index);

            let driver: Arc<dyn TerminalDriver> = match provider.connect() {
                Ok(driver) => driver,
                Err(e) => {
                    warn!(reader = %name, error = %e, "terminal failed to initialize");
                    Arc::new(DeadTerminal)
                },
            };

            let reader = Reader::new(
                name.clone(),
                TerminalHandle::new(driver),
                Enforcer::new(cfg.arf_modes.clone(), cfg.ace_fail_closed),
                identity.clone(),
            );
            reader.spawn_event_listener();
            info!(reader = %name, "terminal registered");
            discovered.push((kind, reader));
        }

        // Stable by construction: same-kind readers keep insertion order.
        discovered.sort_by(|a, b| TerminalKind::enumeration_order(&a.0, &b.0));

        let by_name = DashMap::new();
        let readers: Vec<Arc<Reader>> = discovered
            .into_iter()
            .map(|(_, reader)| {
                by_name.insert(reader.name().to_string(), reader.clone());
                reader
            })
            .collect();
        Self { readers, by_name }
    }

    pub fn reader_names(&self) -> Vec<String> {
        self.readers.iter().map(|r| r.name().to_string()).collect()
    }

    pub fn readers(&self) -> &[Arc<Reader>] {
        &self.readers
    }

    pub fn reader(&self, name: &str) -> SeResult<Arc<Reader>> {
        self.by_name
            .get(name)
            .map(|r| r.clone())
            .ok_or_else(|| SeError::ReferenceNotFound(format!("reader {name}")))
    }

    /// Closes every session and resets per-reader state.
    pub fn shutdown(&self) {
        for reader in &self.readers {
            reader.shutdown();
        }
    }
}

fn validate(provider: &dyn TerminalProvider, kind: &TerminalKind) -> bool {
    let permissions = provider.permissions();
    if !permissions.contains(ProviderPermissions::BIND_TERMINAL) {
        warn!(kind = ?kind, "provider skipped: missing BIND_TERMINAL");
        return false;
    }
    let system = matches!(
        kind,
        TerminalKind::Sim | TerminalKind::Ese | TerminalKind::Sd
    );
    if system && !permissions.contains(ProviderPermissions::SYSTEM_TERMINAL) {
        warn!(kind = ?kind, "provider skipped: system type without SYSTEM_TERMINAL");
        return false;
    }
    true
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("readers", &self.reader_names())
            .finish()
    }
}

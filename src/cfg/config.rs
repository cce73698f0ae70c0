// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{ace::arf::ArfMode, cfg::logger::LoggerConfig};

/// Service configuration.
///
/// ```yaml
/// arf_modes: [sim_alliance, sim_io]
/// ace_fail_closed: true
/// debug: false
/// logger:
///   level: info
///   output: stderr
///   format: text
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Rule-file access methods the loader may use, in preference order.
    #[serde(default = "default_arf_modes")]
    pub arf_modes: Vec<ArfMode>,

    /// When the access-control rules cannot be initialized: deny every
    /// channel open (true, the shipping default) or allow everything
    /// (false, debugging only).
    #[serde(default = "default_true")]
    pub ace_fail_closed: bool,

    /// Enables the diagnostic dump endpoint.
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub logger: Option<LoggerConfig>,
}

fn default_arf_modes() -> Vec<ArfMode> {
    vec![ArfMode::SimAlliance, ArfMode::SimIo]
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arf_modes: default_arf_modes(),
            ace_fail_closed: true,
            debug: false,
            logger: None,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value. The `SE_MUX_CONFIG` environment variable
    /// overrides the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = match std::env::var("SE_MUX_CONFIG") {
            Ok(overridden) => fs::read_to_string(&overridden)
                .with_context(|| format!("failed to read config {overridden}"))?,
            Err(_) => fs::read_to_string(path.as_ref())
                .with_context(|| format!("failed to read config {:?}", path.as_ref()))?,
        };
        let mut cfg: Config =
            serde_yaml::from_str(&raw).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            !self.arf_modes.is_empty(),
            "arf_modes must name at least one access method"
        );
        // Repeated modes would only repeat failed discovery attempts.
        self.arf_modes.dedup();
        if !self.ace_fail_closed {
            tracing::warn!("ace_fail_closed=false: every applet is open to every caller");
        }
        Ok(())
    }
}

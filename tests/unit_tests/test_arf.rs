// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! ARF discovery and loading over its different roots and transports.

use std::sync::Arc;

use anyhow::Result;
use hex_literal::hex;
use se_mux_rs::{
    ace::arf::ArfMode,
    cfg::config::Config,
    terminal::mock::MockTerminal,
};

use super::{APP_AID, ArfImage, ctx, service_with};

fn debug_cfg() -> Config {
    Config { debug: true, ..Config::default() }
}

#[test]
fn rules_load_from_the_pkcs15_adf() -> Result<()> {
    let terminal = Arc::new(MockTerminal::new());
    ArfImage::default().install_as_adf(&terminal);
    terminal.add_adf(&APP_AID, hex!("9000").to_vec());
    let service = service_with(terminal.clone(), debug_cfg());

    service.open_session("SIM1", &ctx())?;

    let dump = service.dump()?;
    // 3 rules x 1 condition entry each.
    assert!(dump.contains("\"access_rules\": 3"), "dump: {dump}");
    assert!(dump.contains("\"rule_source_available\": true"));
    // The loader released its logical channel.
    assert_eq!(terminal.open_channel_count(), 0);
    Ok(())
}

#[test]
fn rules_load_through_ef_dir_discovery() -> Result<()> {
    // No PKCS#15 ADF on this card; EF(DIR) points under the MF.
    let terminal = Arc::new(MockTerminal::new());
    ArfImage::default().install_under_mf(&terminal);
    terminal.add_adf(&APP_AID, hex!("9000").to_vec());
    let service = service_with(terminal, debug_cfg());

    let session = service.open_session("SIM1", &ctx())?;
    let dump = service.dump()?;
    assert!(dump.contains("\"access_rules\": 3"), "dump: {dump}");

    // And the loaded rules actually apply.
    let channel = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;
    channel.transmit(&ctx(), &hex!("80CA010200"))?;
    Ok(())
}

#[test]
fn rules_load_over_sim_io() -> Result<()> {
    let terminal = Arc::new(MockTerminal::new());
    ArfImage::default().install_under_mf(&terminal);
    terminal.add_adf(&APP_AID, hex!("9000").to_vec());
    let cfg = Config {
        arf_modes: vec![ArfMode::SimIo],
        debug: true,
        ..Config::default()
    };
    let service = service_with(terminal.clone(), cfg);

    service.open_session("SIM1", &ctx())?;
    let dump = service.dump()?;
    assert!(dump.contains("\"access_rules\": 3"), "dump: {dump}");
    // SIM-IO never opens a logical channel.
    assert_eq!(terminal.open_channel_count(), 0);
    Ok(())
}

#[test]
fn shared_conditions_file_is_read_once_per_load() -> Result<()> {
    // The wildcard and default rules both reference EF 4405.
    let terminal = Arc::new(MockTerminal::new());
    ArfImage::default().install_as_adf(&terminal);
    let service = service_with(terminal.clone(), debug_cfg());

    service.open_session("SIM1", &ctx())?;

    let selects_of_4405 = terminal
        .transcript()
        .iter()
        .filter(|apdu| {
            apdu[1] == 0xA4 && apdu.windows(2).any(|w| w == hex!("4405"))
        })
        .count();
    assert_eq!(selects_of_4405, 1);
    Ok(())
}

#[test]
fn sim_io_select_reports_legacy_file_info() -> Result<()> {
    use se_mux_rs::{
        ace::arf::fs::ArfFs,
        fcp::{FileStructure, FileType},
        terminal::TerminalHandle,
    };

    let terminal = Arc::new(MockTerminal::new());
    terminal.add_mf_file(0x5031, vec![0xA7; 24]);
    terminal.add_mf_record_file(0x2F00, 16, &[vec![0x61; 4]]);

    let handle = TerminalHandle::new(terminal);
    let io = handle.exclusive();
    let fs = ArfFs::SimIo { io: &io };

    // Transparent file: size and FID come from the legacy image.
    let info = fs.select(&[0x3F00, 0x5031])?;
    assert_eq!(info.file_type, FileType::Ef);
    assert_eq!(info.structure, FileStructure::Transparent);
    assert_eq!(info.file_size, Some(24));
    assert_eq!(info.fid, Some(0x5031));

    // Record file: structure and record shape drive the record reader.
    let info = fs.select(&[0x3F00, 0x2F00])?;
    assert_eq!(info.structure, FileStructure::LinearFixed);
    assert_eq!(info.max_record_size, Some(16));
    assert_eq!(info.number_of_records, Some(1));
    let records = fs.read_records(&[0x3F00, 0x2F00])?;
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0][..4], &[0x61; 4][..]);

    // A file the card does not have surfaces as not-found.
    assert!(matches!(
        fs.select(&[0x3F00, 0x4F99]),
        Err(se_mux_rs::error::SeError::ReferenceNotFound(_))
    ));
    Ok(())
}

#[test]
fn missing_rule_files_disable_the_source() -> Result<()> {
    // The ADF exists but holds no ODF: discovery succeeds, the walk fails.
    let terminal = Arc::new(MockTerminal::new());
    terminal.add_adf(&super::PKCS15_AID, hex!("9000").to_vec());
    let service = service_with(terminal, debug_cfg());

    service.open_session("SIM1", &ctx())?;
    let dump = service.dump()?;
    assert!(dump.contains("\"rule_source_available\": false"), "dump: {dump}");
    Ok(())
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! File-view and PIN providers over a live channel.

use std::sync::Arc;

use anyhow::Result;
use hex_literal::hex;
use se_mux_rs::{
    cfg::config::Config,
    error::SeError,
    fcp::{FileStructure, FileType},
    providers::{AuthenticationProvider, FileSelector, FileViewProvider, PinId},
    service::{Channel, SeService},
};

use super::{PKCS15_AID, ctx, service_with, standard_card};

fn open_pkcs15_channel(
    service: &Arc<SeService>,
) -> Result<Arc<Channel>> {
    let session = service.open_session("SIM1", &ctx())?;
    Ok(session.open_logical_channel(Some(&PKCS15_AID), 0x00, &ctx())?)
}

#[test]
fn file_view_select_and_read() -> Result<()> {
    let terminal = standard_card();
    let odf_bytes = super::ArfImage::default().files()[0].1.clone();
    let service = service_with(terminal, Config::default());
    let channel = open_pkcs15_channel(&service)?;
    let view = FileViewProvider::new(channel, ctx());

    let info = view.select(FileSelector::Fid(0x5031))?;
    assert_eq!(info.fid, Some(0x5031));
    assert_eq!(info.file_type, FileType::Ef);
    assert_eq!(info.structure, FileStructure::Transparent);
    assert_eq!(info.file_size, Some(odf_bytes.len()));

    // Full read via the "to end of file" form.
    assert_eq!(view.read_binary(0, 0)?, odf_bytes);
    // Windowed read.
    assert_eq!(view.read_binary(2, 4)?, odf_bytes[2..6].to_vec());
    Ok(())
}

#[test]
fn file_view_update_binary_roundtrip() -> Result<()> {
    let terminal = standard_card();
    terminal.add_adf_file(&PKCS15_AID, 0x4F01, vec![0x00; 64]);
    let service = service_with(terminal, Config::default());
    let channel = open_pkcs15_channel(&service)?;
    let view = FileViewProvider::new(channel, ctx());

    view.select(FileSelector::Fid(0x4F01))?;
    view.update_binary(8, &hex!("DEADBEEF"))?;
    let mut expected = vec![0x00; 64];
    expected[8..12].copy_from_slice(&hex!("DEADBEEF"));
    assert_eq!(view.read_binary(0, 0)?, expected);

    // Writes past the end surface the card's error.
    assert!(view.update_binary(62, &hex!("AABBCC")).is_err());
    Ok(())
}

#[test]
fn file_view_records_and_parent() -> Result<()> {
    let terminal = standard_card();
    terminal.add_adf_record_file(
        &PKCS15_AID,
        0x4F02,
        8,
        &[hex!("A1A2").to_vec(), hex!("B1B2B3").to_vec()],
    );
    let service = service_with(terminal, Config::default());
    let channel = open_pkcs15_channel(&service)?;
    let view = FileViewProvider::new(channel, ctx());

    let info = view.select(FileSelector::Fid(0x4F02))?;
    assert_eq!(info.structure, FileStructure::LinearFixed);
    assert_eq!(info.max_record_size, Some(8));
    assert_eq!(info.number_of_records, Some(2));

    let record = view.read_record(2)?;
    assert_eq!(&record[..3], hex!("B1B2B3"));
    assert!(matches!(
        view.read_record(3),
        Err(SeError::ReferenceNotFound(_))
    ));
    assert!(matches!(view.read_record(0), Err(SeError::Parameter(_))));

    view.select(FileSelector::Parent)?;
    Ok(())
}

#[test]
fn file_view_path_selection() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal, Config::default());
    let channel = open_pkcs15_channel(&service)?;
    let view = FileViewProvider::new(channel, ctx());

    let info = view.select(FileSelector::Path(vec![0x4401]))?;
    assert_eq!(info.fid, Some(0x4401));

    assert!(matches!(
        view.select(FileSelector::Path(Vec::new())),
        Err(SeError::Parameter(_))
    ));
    Ok(())
}

#[test]
fn pin_verification_and_retry_counter() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    let channel = open_pkcs15_channel(&service)?;
    let number = channel.number();
    let auth = AuthenticationProvider::new(channel, ctx());

    let pin_id = PinId::new(1, false)?;

    // Good PIN.
    let mut expected = vec![number, 0x20, 0x00, 0x01, 0x04];
    expected.extend_from_slice(b"1234");
    terminal.script_exchange(Some(&expected), &hex!("9000"));
    auth.verify_pin(pin_id, b"1234")?;

    // Wrong PIN: the retry counter surfaces in the error.
    terminal.script_exchange(None, &hex!("63C2"));
    let err = auth.verify_pin(pin_id, b"9999").expect_err("wrong pin");
    assert!(matches!(&err, SeError::SecurityDenied(m) if m.contains("2 retries")));

    // Blocked method.
    terminal.script_exchange(None, &hex!("6983"));
    assert!(matches!(
        auth.verify_pin(pin_id, b"9999"),
        Err(SeError::SecurityDenied(_))
    ));

    // Too-short PINs never reach the card.
    assert!(matches!(
        auth.verify_pin(pin_id, b"12"),
        Err(SeError::Parameter(_))
    ));
    Ok(())
}

#[test]
fn pin_management_commands() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    let channel = open_pkcs15_channel(&service)?;
    let number = channel.number();
    let auth = AuthenticationProvider::new(channel, ctx());
    let pin_id = PinId::new(2, true)?;

    // CHANGE REFERENCE DATA carries old || new.
    let mut expected = vec![number, 0x24, 0x00, 0x82, 0x08];
    expected.extend_from_slice(b"12345678");
    terminal.script_exchange(Some(&expected), &hex!("9000"));
    auth.change_pin(pin_id, b"1234", b"5678")?;

    // RESET RETRY COUNTER with a new PIN uses P1=00.
    let mut expected = vec![number, 0x2C, 0x00, 0x82, 0x0C];
    expected.extend_from_slice(b"87654321");
    expected.extend_from_slice(b"1111");
    terminal.script_exchange(Some(&expected), &hex!("9000"));
    auth.reset_pin(pin_id, b"87654321", Some(b"1111"))?;

    // Unblock only uses P1=01.
    let mut expected = vec![number, 0x2C, 0x01, 0x82, 0x08];
    expected.extend_from_slice(b"87654321");
    terminal.script_exchange(Some(&expected), &hex!("9000"));
    auth.reset_pin(pin_id, b"87654321", None)?;

    // ENABLE / DISABLE.
    terminal.script_exchange(None, &hex!("9000"));
    auth.disable_pin(pin_id, b"1234")?;
    terminal.script_exchange(None, &hex!("9000"));
    auth.enable_pin(pin_id, b"1234")?;
    Ok(())
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Access-control enforcement scenarios: filters, refresh-tag
//! revalidation, fail-closed policy and NFC gating.

use std::sync::Arc;

use anyhow::Result;
use hex_literal::hex;
use se_mux_rs::{
    ace::AccessDecision,
    cfg::config::Config,
    error::SeError,
    service::ClientContext,
    terminal::{SeEvent, mock::MockTerminal},
};

use super::{APP_AID, ArfImage, OTHER_PID, ctx, service_with, standard_card};

#[test]
fn s4_apdu_filter_allows_one_header_and_blocks_the_rest() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    let session = service.open_session("SIM1", &ctx())?;

    // H1 opens the filtered applet fine.
    let channel = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;

    // GET DATA matches the 80CA0000/FFFF0000 filter.
    terminal.clear_transcript();
    channel.transmit(&ctx(), &hex!("80CA010200"))?;
    assert_eq!(terminal.transmit_count(), 1);

    // READ BINARY does not; it must never reach the driver.
    assert!(matches!(
        channel.transmit(&ctx(), &hex!("00B0000010")),
        Err(SeError::SecurityDenied(_))
    ));
    assert_eq!(terminal.transmit_count(), 1);
    Ok(())
}

#[test]
fn filtered_applet_is_closed_to_other_certificates() -> Result<()> {
    // No wildcard rule on this card: what the specific rules miss denies.
    let terminal = Arc::new(MockTerminal::new());
    let image = ArfImage { include_wildcard: false, ..ArfImage::default() };
    image.install_as_adf(&terminal);
    terminal.add_adf(&APP_AID, hex!("9000").to_vec());
    let service = service_with(terminal, Config::default());

    let other = ClientContext::new(OTHER_PID);
    let session = service.open_session("SIM1", &other)?;
    assert!(matches!(
        session.open_logical_channel(Some(&APP_AID), 0x00, &other),
        Err(SeError::SecurityDenied(_))
    ));
    Ok(())
}

#[test]
fn wildcard_rule_backstops_unmatched_certificates() -> Result<()> {
    // With the wildcard present, a caller the specific rule does not name
    // falls through to it (and gets unfiltered access).
    let terminal = standard_card();
    let service = service_with(terminal, Config::default());

    let other = ClientContext::new(OTHER_PID);
    let session = service.open_session("SIM1", &other)?;
    let channel = session.open_logical_channel(Some(&APP_AID), 0x00, &other)?;
    channel.transmit(&other, &hex!("00B0000010"))?;
    Ok(())
}

#[test]
fn s5_unchanged_refresh_tag_skips_the_rule_reload() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());

    // First session: full load.
    let session = service.open_session("SIM1", &ctx())?;
    session.close(&ctx())?;

    // Same card, new card session.
    let reader = service.reader("SIM1")?;
    reader.on_se_state_changed(SeEvent::Reset);

    terminal.clear_transcript();
    let session = service.open_session("SIM1", &ctx())?;

    // The revalidation walked ODF/DODF/ACMain but touched neither
    // EF(ACRules) nor EF(ACConditions).
    let touched: Vec<String> =
        terminal.transcript().iter().map(hex::encode).collect();
    assert!(
        touched.iter().any(|apdu| apdu.contains("4403")),
        "EF(ACMain) must be re-read: {touched:?}"
    );
    for rules_fid in ["4404", "4405", "4406"] {
        assert!(
            !touched.iter().any(|apdu| apdu.contains(rules_fid)),
            "EF({rules_fid}) must not be read on an unchanged tag: {touched:?}"
        );
    }

    // And the cached rules still work.
    let channel = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;
    channel.transmit(&ctx(), &hex!("80CA010200"))?;
    Ok(())
}

#[test]
fn changed_refresh_tag_reloads_and_replaces_rules() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    service.open_session("SIM1", &ctx())?.close(&ctx())?;

    // Rewrite the card: new tag, and the rule files now deny everything
    // (an empty conditions entry).
    let image = ArfImage {
        refresh_tag: hex!("FFFFFFFFFFFFFFFF"),
        ..ArfImage::default()
    };
    image.install_as_adf(&terminal);
    for fid in [0x4405u16, 0x4406] {
        terminal.add_adf_file(&super::PKCS15_AID, fid, hex!("3000").to_vec());
    }

    let reader = service.reader("SIM1")?;
    reader.on_se_state_changed(SeEvent::Reset);

    let session = service.open_session("SIM1", &ctx())?;
    assert!(matches!(
        session.open_logical_channel(Some(&APP_AID), 0x00, &ctx()),
        Err(SeError::SecurityDenied(_))
    ));
    Ok(())
}

#[test]
fn removal_resets_the_cache_entirely() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    service.open_session("SIM1", &ctx())?.close(&ctx())?;

    let reader = service.reader("SIM1")?;
    reader.on_se_state_changed(SeEvent::Removed);

    // Same tag on the card, but a removal dropped it; the next session
    // re-reads the whole rule chain.
    terminal.clear_transcript();
    service.open_session("SIM1", &ctx())?;
    let touched: Vec<String> =
        terminal.transcript().iter().map(hex::encode).collect();
    assert!(
        touched.iter().any(|apdu| apdu.contains("4404")),
        "EF(ACRules) must be re-read after removal: {touched:?}"
    );
    Ok(())
}

#[test]
fn missing_rule_source_fails_closed() -> Result<()> {
    // A card with applets but no rule file system at all.
    let terminal = Arc::new(MockTerminal::new());
    terminal.add_adf(&APP_AID, hex!("9000").to_vec());
    let service = service_with(terminal, Config::default());

    let session = service.open_session("SIM1", &ctx())?;
    let denied = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx());
    assert!(matches!(denied, Err(SeError::SecurityDenied(_))));
    Ok(())
}

#[test]
fn missing_rule_source_can_fail_open_for_debugging() -> Result<()> {
    let terminal = Arc::new(MockTerminal::new());
    terminal.add_adf(&APP_AID, hex!("9000").to_vec());
    let cfg = Config { ace_fail_closed: false, ..Config::default() };
    let service = service_with(terminal, cfg);

    let session = service.open_session("SIM1", &ctx())?;
    let channel = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;
    channel.transmit(&ctx(), &hex!("80CA010200"))?;
    Ok(())
}

#[test]
fn nfc_event_access_follows_the_rules() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal, Config::default());
    let reader = service.reader("SIM1")?;
    service.open_session("SIM1", &ctx())?;

    // The wildcard condition grants NFC outright.
    assert_eq!(
        reader.nfc_event_access(Some(&super::PKCS15_AID), &ctx())?,
        AccessDecision::Allowed
    );

    // Without a wildcard, callers the rules do not name get nothing.
    let terminal = Arc::new(MockTerminal::new());
    let image = ArfImage { include_wildcard: false, ..ArfImage::default() };
    image.install_as_adf(&terminal);
    terminal.add_adf(&APP_AID, hex!("9000").to_vec());
    let service = service_with(terminal, Config::default());
    let reader = service.reader("SIM1")?;
    let other = ClientContext::new(OTHER_PID);
    service.open_session("SIM1", &other)?;
    assert_eq!(
        reader.nfc_event_access(Some(&APP_AID), &other)?,
        AccessDecision::Denied
    );
    Ok(())
}

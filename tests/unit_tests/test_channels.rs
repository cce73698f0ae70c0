// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Channel/session engine scenarios: open, transmit post-processing,
//! forbidden commands, slot bookkeeping and client-death cleanup.

use anyhow::Result;
use hex_literal::hex;
use se_mux_rs::{
    cfg::config::Config,
    error::SeError,
    service::ClientContext,
};

use super::{APP_AID, CLIENT_PID, PKCS15_AID, ctx, service_with, standard_card};

#[test]
fn s1_open_and_select_pkcs15_applet() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal, Config::default());

    let session = service.open_session("SIM1", &ctx())?;
    let channel = session.open_logical_channel(Some(&PKCS15_AID), 0x00, &ctx())?;

    assert_ne!(channel.number(), 0);
    let select_response = channel.select_response().expect("select response");
    assert_eq!(&select_response[select_response.len() - 2..], hex!("9000"));
    Ok(())
}

#[test]
fn s2_get_response_concatenation() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    let session = service.open_session("SIM1", &ctx())?;
    let channel = session
        .open_basic_channel(None, 0x00, &ctx())?
        .expect("basic channel");

    terminal.clear_transcript();
    let tail: Vec<u8> = (0u8..14).collect();
    let mut first = hex!("AABB").to_vec();
    first.extend_from_slice(&hex!("6110"));
    let mut second = tail.clone();
    second.extend_from_slice(&hex!("9000"));
    terminal.script_exchange(Some(&hex!("80CA010200")), &first);
    terminal.script_exchange(Some(&hex!("80C0000010")), &second);

    let reply = channel.transmit(&ctx(), &hex!("80CA010200"))?;

    let mut expected = hex!("AABB").to_vec();
    expected.extend_from_slice(&tail);
    expected.extend_from_slice(&hex!("9000"));
    assert_eq!(&reply[..], expected);
    // Exactly one extra driver exchange: the GET RESPONSE.
    assert_eq!(terminal.transmit_count(), 2);
    Ok(())
}

#[test]
fn s3_forbidden_commands_never_reach_the_driver() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    let session = service.open_session("SIM1", &ctx())?;
    let channel = session
        .open_basic_channel(None, 0x00, &ctx())?
        .expect("basic channel");

    terminal.clear_transcript();
    // MANAGE CHANNEL.
    assert!(matches!(
        channel.transmit(&ctx(), &hex!("0070000001")),
        Err(SeError::SecurityDenied(_))
    ));
    // SELECT by DF name.
    assert!(matches!(
        channel.transmit(&ctx(), &hex!("00A4040002AABB")),
        Err(SeError::SecurityDenied(_))
    ));
    // SELECT by DF name on a proprietary class byte is just as forbidden.
    assert!(matches!(
        channel.transmit(&ctx(), &hex!("80A4040002AABB")),
        Err(SeError::SecurityDenied(_))
    ));
    assert_eq!(terminal.transmit_count(), 0);
    Ok(())
}

#[test]
fn s6_wrong_le_retry() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    let session = service.open_session("SIM1", &ctx())?;
    let channel = session
        .open_basic_channel(None, 0x00, &ctx())?
        .expect("basic channel");

    terminal.clear_transcript();
    let mut payload = vec![0x55; 128];
    payload.extend_from_slice(&hex!("9000"));
    terminal.script_exchange(Some(&hex!("00B00000FF")), &hex!("6C80"));
    terminal.script_exchange(Some(&hex!("00B0000080")), &payload);

    let reply = channel.transmit(&ctx(), &hex!("00B00000FF"))?;
    assert_eq!(reply.len(), 130);
    assert_eq!(&reply[..128], &[0x55; 128][..]);
    assert_eq!(&reply[128..], hex!("9000"));
    assert_eq!(terminal.transmit_count(), 2);
    Ok(())
}

#[test]
fn channel_bits_match_the_channel_number() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    let session = service.open_session("SIM1", &ctx())?;
    let channel = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;

    terminal.clear_transcript();
    // GET DATA is what the filter-free rule set lets through everywhere.
    channel.transmit(&ctx(), &hex!("80CA9F7F00"))?;
    let seen = terminal.transcript();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        se_mux_rs::apdu::cla::channel_of(seen[0][0]),
        channel.number()
    );
    Ok(())
}

#[test]
fn short_commands_and_foreign_pids_are_rejected() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal, Config::default());
    let session = service.open_session("SIM1", &ctx())?;
    let channel = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;

    assert!(matches!(
        channel.transmit(&ctx(), &hex!("00A400")),
        Err(SeError::Parameter(_))
    ));
    // A different process may not talk on this channel, even a known one.
    assert!(matches!(
        channel.transmit(&ClientContext::new(super::OTHER_PID), &hex!("80CA9F7F00")),
        Err(SeError::SecurityDenied(_))
    ));
    Ok(())
}

#[test]
fn close_releases_the_slot_and_is_idempotent() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    let session = service.open_session("SIM1", &ctx())?;
    let channel = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;

    assert_eq!(terminal.open_channel_count(), 1);
    channel.close(&ctx())?;
    assert_eq!(terminal.open_channel_count(), 0);
    assert!(channel.is_closed());
    assert_eq!(session.channel_count(), 0);

    // Second close: no error, no driver traffic.
    terminal.clear_transcript();
    channel.close(&ctx())?;
    assert_eq!(terminal.transmit_count(), 0);
    assert!(matches!(
        channel.transmit(&ctx(), &hex!("80CA9F7F00")),
        Err(SeError::ChannelClosed)
    ));
    Ok(())
}

#[test]
fn at_most_one_basic_channel_per_reader() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal, Config::default());
    let session = service.open_session("SIM1", &ctx())?;

    let first = session.open_basic_channel(None, 0x00, &ctx())?;
    assert!(first.is_some());
    // Second attempt returns null rather than failing.
    assert!(session.open_basic_channel(None, 0x00, &ctx())?.is_none());

    // Releasing the slot makes it available again.
    first.expect("channel").close(&ctx())?;
    assert!(session.open_basic_channel(None, 0x00, &ctx())?.is_some());
    Ok(())
}

#[test]
fn basic_channel_with_aid_clears_the_default_application_flag() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal, Config::default());
    let session = service.open_session("SIM1", &ctx())?;

    let channel = session
        .open_basic_channel(Some(&APP_AID), 0x00, &ctx())?
        .expect("basic channel");
    let select_response = channel.select_response().expect("select response");
    assert_eq!(&select_response[select_response.len() - 2..], hex!("9000"));
    channel.close(&ctx())?;

    // The default application is gone; an AID-less open now yields null.
    assert!(session.open_basic_channel(None, 0x00, &ctx())?.is_none());
    Ok(())
}

#[test]
fn basic_channel_with_unknown_aid_reports_no_such_element() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal, Config::default());
    let session = service.open_session("SIM1", &ctx())?;

    let missing = hex!("A0000001519999");
    assert!(matches!(
        session.open_basic_channel(Some(&missing), 0x00, &ctx()),
        Err(SeError::ReferenceNotFound(_))
    ));
    Ok(())
}

#[test]
fn logical_channel_exhaustion_maps_to_resource_exhausted() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal, Config::default());
    let session = service.open_session("SIM1", &ctx())?;

    // The mock card has three logical channels.
    let _a = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;
    let _b = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;
    let _c = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;
    assert!(matches!(
        session.open_logical_channel(Some(&APP_AID), 0x00, &ctx()),
        Err(SeError::ResourceExhausted)
    ));
    Ok(())
}

#[test]
fn malformed_aids_are_parameter_errors() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal, Config::default());
    let session = service.open_session("SIM1", &ctx())?;

    assert!(matches!(
        session.open_logical_channel(Some(&[0xA0; 4]), 0x00, &ctx()),
        Err(SeError::Parameter(_))
    ));
    assert!(matches!(
        session.open_logical_channel(Some(&[0xA0; 17]), 0x00, &ctx()),
        Err(SeError::Parameter(_))
    ));
    Ok(())
}

#[test]
fn session_close_closes_every_channel() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    let session = service.open_session("SIM1", &ctx())?;

    let logical = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;
    let basic = session
        .open_basic_channel(None, 0x00, &ctx())?
        .expect("basic channel");

    session.close(&ctx())?;
    assert!(session.is_closed());
    assert!(logical.is_closed());
    assert!(basic.is_closed());
    assert_eq!(terminal.open_channel_count(), 0);
    assert!(matches!(
        session.open_logical_channel(Some(&APP_AID), 0x00, &ctx()),
        Err(SeError::ChannelClosed)
    ));
    Ok(())
}

#[test]
fn client_death_releases_only_that_clients_channels() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());

    let session = service.open_session("SIM1", &ctx())?;
    let doomed = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;

    let other_ctx = ClientContext::new(super::OTHER_PID);
    let other_session = service.open_session("SIM1", &other_ctx)?;
    let survivor = other_session.open_logical_channel(Some(&PKCS15_AID), 0x00, &other_ctx)?;

    service.client_died(CLIENT_PID);

    assert!(doomed.is_closed());
    assert!(!survivor.is_closed());
    assert_eq!(terminal.open_channel_count(), 1);
    Ok(())
}

#[test]
fn death_watch_thread_drives_the_cleanup() -> Result<()> {
    use std::time::Duration;

    use se_mux_rs::service::DeathWatch;

    let terminal = standard_card();
    let service = service_with(terminal, Config::default());
    let session = service.open_session("SIM1", &ctx())?;
    let channel = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;

    let (watch, died) = DeathWatch::new();
    let _watcher = service.spawn_death_watch(died);
    watch.notify_died(CLIENT_PID);

    // The cleanup runs on the watcher thread; give it a moment.
    for _ in 0..200 {
        if channel.is_closed() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("channel was not closed by the death watch");
}

#[test]
fn select_next_walks_matching_applets() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    let session = service.open_session("SIM1", &ctx())?;
    let channel = session.open_logical_channel(Some(&APP_AID), 0x00, &ctx())?;

    // One more occurrence exists, then the card runs out.
    let mut next = hex!("6F0A8408A0000001510000019000").to_vec();
    terminal.script_exchange(None, &next);
    assert!(channel.select_next(&ctx())?);
    next.truncate(next.len() - 2);
    let stored = channel.select_response().expect("select response");
    assert_eq!(&stored[..stored.len() - 2], &next[..]);

    terminal.script_exchange(None, &hex!("6A82"));
    assert!(!channel.select_next(&ctx())?);
    assert!(channel.select_response().is_none());
    Ok(())
}

#[test]
fn extended_commands_chain_through_envelope() -> Result<()> {
    let terminal = standard_card();
    let service = service_with(terminal.clone(), Config::default());
    let session = service.open_session("SIM1", &ctx())?;
    let channel = session
        .open_basic_channel(None, 0x00, &ctx())?
        .expect("basic channel");

    terminal.clear_transcript();
    // 600 data bytes force the extended form; the mock card is short-only.
    let cmd = se_mux_rs::apdu::CommandApdu::new(0x80, 0xCA, 0x00, 0x00)
        .with_data(vec![0x5A; 600]);
    let raw = cmd.encode()?;

    for _ in 0..3 {
        terminal.script_exchange(None, &hex!("9000"));
    }
    terminal.script_exchange(None, &hex!("AA9000"));

    let reply = channel.transmit(&ctx(), &raw)?;
    assert_eq!(&reply[..], hex!("AA9000"));

    let seen = terminal.transcript();
    assert_eq!(seen.len(), 4);
    // Every frame on the wire is a short ENVELOPE carrying the original
    // encoded command.
    let mut carried = Vec::new();
    for frame in &seen[..3] {
        assert_eq!(frame[1], 0xC2);
        carried.extend_from_slice(&frame[5..]);
    }
    assert_eq!(carried, raw.to_vec());
    assert_eq!(seen[3][1], 0xC2);
    Ok(())
}

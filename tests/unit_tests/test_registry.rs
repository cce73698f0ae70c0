// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reader discovery, validation, naming and enumeration order.

use std::sync::Arc;

use anyhow::Result;
use se_mux_rs::{
    cfg::config::Config,
    error::SeError,
    service::SeService,
    terminal::{
        ProviderPermissions, TerminalKind, TerminalProvider,
        mock::{MockProvider, MockTerminal},
    },
};

use super::{ctx, identity};

fn provider(kind: TerminalKind) -> Box<dyn TerminalProvider> {
    Box::new(MockProvider::new(kind, Arc::new(MockTerminal::new())))
}

#[test]
fn canonical_names_and_enumeration_order() -> Result<()> {
    let providers: Vec<Box<dyn TerminalProvider>> = vec![
        provider(TerminalKind::Sd),
        provider(TerminalKind::Sim),
        provider(TerminalKind::Ese),
        provider(TerminalKind::Sim),
        provider(TerminalKind::Other("FOO".into())),
    ];
    let service = SeService::new(Config::default(), &providers, identity());

    // Indices follow discovery order within a type; enumeration puts SIMs
    // first, then eSE, then SD, then the rest.
    assert_eq!(
        service.reader_names()?,
        vec!["SIM1", "SIM2", "eSE1", "SD1", "FOO1"]
    );
    Ok(())
}

#[test]
fn providers_without_permissions_are_skipped() -> Result<()> {
    let no_bind = Box::new(
        MockProvider::new(TerminalKind::Sim, Arc::new(MockTerminal::new()))
            .with_permissions(ProviderPermissions::SYSTEM_TERMINAL),
    );
    let no_system = Box::new(
        MockProvider::new(TerminalKind::Ese, Arc::new(MockTerminal::new()))
            .with_permissions(ProviderPermissions::BIND_TERMINAL),
    );
    // Non-system types only need BIND_TERMINAL.
    let plain = Box::new(
        MockProvider::new(
            TerminalKind::Other("USB".into()),
            Arc::new(MockTerminal::new()),
        )
        .with_permissions(ProviderPermissions::BIND_TERMINAL),
    );
    let providers: Vec<Box<dyn TerminalProvider>> = vec![no_bind, no_system, plain];
    let service = SeService::new(Config::default(), &providers, identity());

    assert_eq!(service.reader_names()?, vec!["USB1"]);
    Ok(())
}

#[test]
fn failed_initialization_keeps_the_reader_enumerable() -> Result<()> {
    let broken = Box::new(
        MockProvider::new(TerminalKind::Sim, Arc::new(MockTerminal::new())).failing(),
    );
    let providers: Vec<Box<dyn TerminalProvider>> = vec![broken];
    let service = SeService::new(Config::default(), &providers, identity());

    assert_eq!(service.reader_names()?, vec!["SIM1"]);
    let reader = service.reader("SIM1")?;
    assert!(!reader.is_card_present());
    assert!(matches!(
        reader.open_session(&ctx()),
        Err(SeError::NotConnected(_))
    ));
    Ok(())
}

#[test]
fn unknown_reader_name_is_not_found() -> Result<()> {
    let providers: Vec<Box<dyn TerminalProvider>> = vec![provider(TerminalKind::Sim)];
    let service = SeService::new(Config::default(), &providers, identity());

    assert!(service.reader("SIM1").is_ok());
    assert!(matches!(
        service.reader("SIM2"),
        Err(SeError::ReferenceNotFound(_))
    ));
    // Names are case-sensitive.
    assert!(matches!(
        service.reader("sim1"),
        Err(SeError::ReferenceNotFound(_))
    ));
    Ok(())
}

#[test]
fn shutdown_closes_sessions_and_disconnects_the_facade() -> Result<()> {
    let terminal = super::standard_card();
    let service = super::service_with(terminal, Config::default());

    let session = service.open_session("SIM1", &ctx())?;
    service.shutdown();

    assert!(session.is_closed());
    assert!(matches!(service.reader_names(), Err(SeError::NotConnected(_))));
    assert!(matches!(service.dump(), Err(SeError::NotConnected(_))));
    // Shutting down twice is fine.
    service.shutdown();
    Ok(())
}

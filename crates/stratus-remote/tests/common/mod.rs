//! Common test utilities for dispatch integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stratus_remote::{
    Credential, Host, HostScript, HostSet, RemoteCommandDispatcher, ScriptedTransport,
};

/// Host set with the given addresses, in order.
pub fn hosts(addresses: &[&str]) -> HostSet {
    addresses
        .iter()
        .map(|a| Host::new(*a, "hadoop", Credential::KeyFile(PathBuf::from("/keys/c.pem"))))
        .collect()
}

/// Host answering `output` after `millis` milliseconds.
pub fn answering(output: &str, millis: u64) -> HostScript {
    HostScript::new(output).with_delay(Duration::from_millis(millis))
}

/// Dispatcher over a clone of `transport`, so the test keeps its journal.
pub fn dispatcher(transport: &ScriptedTransport) -> RemoteCommandDispatcher {
    RemoteCommandDispatcher::new(Arc::new(transport.clone()))
}

#![allow(dead_code)] // each test binary uses a subset of these helpers

use std::{
    io::Write,
    sync::mpsc::{Receiver, channel},
    time::{Duration, Instant},
};

use crossbar::{Bus, BusConfig, BusEvent, Endpoint, Utf8Codec};
use tempfile::NamedTempFile;

pub type Event = BusEvent<String>;
pub type StringBus = Bus<Utf8Codec>;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Builds and starts a string bus whose events land on a channel.
pub fn start_bus(config: BusConfig) -> (StringBus, Receiver<Event>) {
    let (tx, rx) = channel();
    let bus = Bus::new(config, Utf8Codec, move |event| {
        let _ = tx.send(event);
    })
    .expect("failed to build bus");
    bus.start().expect("failed to start bus");
    (bus, rx)
}

/// Config listening on an ephemeral localhost port.
pub fn listen_config(identity: &str) -> BusConfig {
    BusConfig::new(identity).with_listen(Endpoint::new("127.0.0.1", 0))
}

pub fn endpoint_of(bus: &StringBus) -> Endpoint {
    bus.listening_endpoint().expect("bus has no listening endpoint")
}

pub fn next_event(events: &Receiver<Event>) -> Event {
    events.recv_timeout(TIMEOUT).expect("timed out waiting for a bus event")
}

pub fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Self-signed certificate plus private key in one PEM file, the layout the
/// bus expects for `cert_path`.
pub fn test_cert() -> NamedTempFile {
    let cert =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .expect("failed to generate test certificate");

    let mut file = NamedTempFile::new().expect("failed to create cert file");
    let pem = format!(
        "{}{}",
        cert.serialize_pem().expect("failed to serialize certificate"),
        cert.serialize_private_key_pem()
    );
    file.write_all(pem.as_bytes()).expect("failed to write cert file");
    file
}

mod common;

use crossbar::{BusConfig, BusEvent};

/// Two buses with different tokens: the listener drops the connection on the
/// first frame and never surfaces a message for it.
#[test]
fn mismatched_tokens_close_the_connection() {
    let (bus_a, events_a) = common::start_bus(BusConfig::new("alpha").with_auth_token("T1"));
    let (bus_b, events_b) = common::start_bus(common::listen_config("beta").with_auth_token("T2"));

    let id = bus_a.connect(common::endpoint_of(&bus_b)).unwrap();
    assert!(bus_a.send(id, &"x".to_string()).unwrap());

    match common::next_event(&events_a) {
        BusEvent::OutgoingConnectionEstablished { id: established } => assert_eq!(established, id),
        other => panic!("unexpected event on alpha: {other:?}"),
    }
    match common::next_event(&events_a) {
        BusEvent::OutgoingConnectionClosed { id: closed } => assert_eq!(closed, id),
        other => panic!("unexpected event on alpha: {other:?}"),
    }

    let BusEvent::NewIncomingConnection { id: incoming, .. } = common::next_event(&events_b) else {
        panic!("beta must see the connection event first");
    };
    match common::next_event(&events_b) {
        BusEvent::IncomingConnectionClosed { id } => assert_eq!(id, incoming),
        other => panic!("beta must never see a frame from an unauthorized peer: {other:?}"),
    }

    bus_a.stop();
    bus_b.stop();
}

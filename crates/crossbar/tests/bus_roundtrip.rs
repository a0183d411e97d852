mod common;

use crossbar::{BusConfig, BusEvent};

#[test]
fn tls_echo_with_auth() {
    let cert = common::test_cert();
    let (bus_a, events_a) = common::start_bus(
        common::listen_config("alpha")
            .with_auth_token("T")
            .with_tls(Some(cert.path().to_path_buf())),
    );
    let (bus_b, events_b) = common::start_bus(
        common::listen_config("beta")
            .with_auth_token("T")
            .with_tls(Some(cert.path().to_path_buf())),
    );

    let id = bus_b.connect(common::endpoint_of(&bus_a)).unwrap();
    assert!(bus_b.send(id, &"hi".to_string()).unwrap());

    match common::next_event(&events_b) {
        BusEvent::OutgoingConnectionEstablished { id: established } => assert_eq!(established, id),
        other => panic!("unexpected event on beta: {other:?}"),
    }

    let BusEvent::NewIncomingConnection { id: incoming, .. } = common::next_event(&events_a) else {
        panic!("alpha must see the connection before any message");
    };
    match common::next_event(&events_a) {
        BusEvent::IncomingMessage { id, message } => {
            assert_eq!(id, incoming);
            assert_eq!(message, "hi");
        }
        other => panic!("unexpected event on alpha: {other:?}"),
    }

    bus_b.stop();
    bus_a.stop();
}

/// A message sent immediately after connect() must always arrive after the
/// auth token, i.e. it is the first thing the receiver observes on the new
/// connection.
#[test]
fn connect_then_send_is_ordered() {
    let (bus_a, events_a) = common::start_bus(BusConfig::new("alpha").with_auth_token("shared"));
    let (bus_b, events_b) = common::start_bus(common::listen_config("beta").with_auth_token("shared"));
    let target = common::endpoint_of(&bus_b);

    for round in 0..100 {
        let id = bus_a.connect(target.clone()).unwrap();
        assert!(bus_a.send(id, &"asdf".to_string()).unwrap(), "round {round}");

        let BusEvent::NewIncomingConnection { id: incoming, .. } = common::next_event(&events_b)
        else {
            panic!("round {round}: expected the connection event first");
        };
        match common::next_event(&events_b) {
            BusEvent::IncomingMessage { id, message } => {
                assert_eq!(id, incoming, "round {round}");
                assert_eq!(message, "asdf", "round {round}");
            }
            other => panic!("round {round}: expected the message second, got {other:?}"),
        }

        match common::next_event(&events_a) {
            BusEvent::OutgoingConnectionEstablished { id: established } => {
                assert_eq!(established, id, "round {round}");
            }
            other => panic!("round {round}: unexpected event on alpha: {other:?}"),
        }
    }

    bus_a.stop();
    bus_b.stop();
}

mod common;

use std::{
    sync::{Arc, Mutex, mpsc::channel},
    time::{Duration, Instant},
};

use crossbar::{Bus, BusConfig, BusEvent, Endpoint, Schedule, Utf8Codec};

#[test]
fn stopped_is_the_last_event_on_both_peers() {
    let (bus_a, events_a) = common::start_bus(BusConfig::new("alpha"));
    let (bus_b, events_b) = common::start_bus(common::listen_config("beta"));

    let id = bus_a.connect(common::endpoint_of(&bus_b)).unwrap();
    assert!(bus_a.send(id, &"ping".to_string()).unwrap());
    // make sure traffic flowed before stopping
    loop {
        if let BusEvent::IncomingMessage { message, .. } = common::next_event(&events_b) {
            assert_eq!(message, "ping");
            break;
        }
    }

    bus_a.stop();
    bus_b.stop();

    let remaining_a: Vec<_> = events_a.try_iter().collect();
    let remaining_b: Vec<_> = events_b.try_iter().collect();
    assert_eq!(remaining_a.last(), Some(&BusEvent::Stopped));
    assert_eq!(remaining_b.last(), Some(&BusEvent::Stopped));
}

#[test]
fn close_connection_notifies_both_sides() {
    let (bus_a, events_a) = common::start_bus(BusConfig::new("alpha"));
    let (bus_b, events_b) = common::start_bus(common::listen_config("beta"));

    let id = bus_a.connect(common::endpoint_of(&bus_b)).unwrap();
    match common::next_event(&events_a) {
        BusEvent::OutgoingConnectionEstablished { .. } => {}
        other => panic!("unexpected event on alpha: {other:?}"),
    }
    let BusEvent::NewIncomingConnection { id: incoming, .. } = common::next_event(&events_b) else {
        panic!("beta must see the connection event first");
    };

    bus_a.close_connection(id);
    match common::next_event(&events_a) {
        BusEvent::OutgoingConnectionClosed { id: closed } => assert_eq!(closed, id),
        other => panic!("unexpected event on alpha: {other:?}"),
    }
    match common::next_event(&events_b) {
        BusEvent::IncomingConnectionClosed { id: closed } => assert_eq!(closed, incoming),
        other => panic!("unexpected event on beta: {other:?}"),
    }

    // a second close of a dead id is a no-op
    bus_a.close_connection(id);
    // and the id now refuses sends outright
    assert!(!bus_a.send(id, &"too late".to_string()).unwrap());

    bus_a.stop();
    bus_b.stop();
}

#[test]
fn connect_to_a_dead_port_fails() {
    let (bus_a, events_a) = common::start_bus(BusConfig::new("alpha"));

    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
        // dropped: nothing listens here any more
    };

    let id = bus_a.connect(Endpoint::new("127.0.0.1", port)).unwrap();
    match common::next_event(&events_a) {
        BusEvent::OutgoingConnectionFailed { id: failed } => assert_eq!(failed, id),
        other => panic!("unexpected event on alpha: {other:?}"),
    }
    assert!(!bus_a.send(id, &"nope".to_string()).unwrap());

    bus_a.stop();
}

#[test]
fn scheduled_callbacks_fire_in_deadline_order() {
    let (bus, _events) = common::start_bus(BusConfig::new("timer"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let base = Instant::now() + Duration::from_millis(50);
    for i in 0..10u64 {
        let seen = Arc::clone(&seen);
        bus.schedule_callback(Schedule::At(base - Duration::from_millis(i)), move || {
            seen.lock().unwrap().push(i);
        });
    }

    assert!(common::wait_until(|| seen.lock().unwrap().len() == 10, common::TIMEOUT));
    assert_eq!(*seen.lock().unwrap(), (0..10).rev().collect::<Vec<_>>());

    bus.stop();
}

#[test]
fn panicking_callback_does_not_kill_the_bus() {
    let (tx, rx) = channel();
    let bus_b = Bus::new(common::listen_config("grumpy"), Utf8Codec, move |event| {
        if let BusEvent::IncomingMessage { message, .. } = &event {
            assert!(message != "boom", "rigged to blow");
        }
        let _ = tx.send(event);
    })
    .unwrap();
    bus_b.start().unwrap();

    let (bus_a, _events_a) = common::start_bus(BusConfig::new("alpha"));
    let id = bus_a.connect(bus_b.listening_endpoint().unwrap()).unwrap();
    assert!(bus_a.send(id, &"boom".to_string()).unwrap());
    assert!(bus_a.send(id, &"still here".to_string()).unwrap());

    loop {
        match rx.recv_timeout(common::TIMEOUT).expect("bus died after a callback panic") {
            BusEvent::IncomingMessage { message, .. } => {
                assert_eq!(message, "still here");
                break;
            }
            _ => {}
        }
    }

    bus_a.stop();
    bus_b.stop();
}

#[test]
fn empty_messages_are_accepted_but_never_sent() {
    let (bus_a, events_a) = common::start_bus(BusConfig::new("alpha"));
    let (bus_b, events_b) = common::start_bus(common::listen_config("beta"));

    let id = bus_a.connect(common::endpoint_of(&bus_b)).unwrap();
    match common::next_event(&events_a) {
        BusEvent::OutgoingConnectionEstablished { .. } => {}
        other => panic!("unexpected event on alpha: {other:?}"),
    }

    assert!(bus_a.send(id, &String::new()).unwrap());
    assert!(bus_a.send(id, &"real".to_string()).unwrap());

    let BusEvent::NewIncomingConnection { .. } = common::next_event(&events_b) else {
        panic!("beta must see the connection event first");
    };
    match common::next_event(&events_b) {
        BusEvent::IncomingMessage { message, .. } => assert_eq!(message, "real"),
        other => panic!("unexpected event on beta: {other:?}"),
    }

    bus_a.stop();
    bus_b.stop();
}

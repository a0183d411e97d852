mod common;

use std::{thread, time::Duration};

use crossbar::{BusConfig, BusEvent};

const MESSAGE_COUNT: usize = 12;
const MESSAGE_BYTES: usize = 700 * 1024;

/// With a 1 MiB cap and 700 KiB messages the producer must spend time parked
/// in `send` while the wire drains, and every message still arrives intact
/// and in order.
#[test]
fn producer_blocks_at_the_byte_cap() {
    let (bus_a, events_a) =
        common::start_bus(BusConfig::new("alpha").with_max_write_queue_bytes(1 << 20));
    let (bus_b, events_b) = common::start_bus(common::listen_config("beta"));

    let id = bus_a.connect(common::endpoint_of(&bus_b)).unwrap();
    match common::next_event(&events_a) {
        BusEvent::OutgoingConnectionEstablished { .. } => {}
        other => panic!("unexpected event on alpha: {other:?}"),
    }

    let mut observed_blocked = false;
    thread::scope(|scope| {
        let bus_a = &bus_a;
        let producer = scope.spawn(move || {
            for seq in 0..MESSAGE_COUNT {
                // 700 KiB, first two bytes carry the sequence number
                let msg = format!("{seq:02}").repeat(MESSAGE_BYTES / 2);
                assert!(bus_a.send(id, &msg).unwrap());
            }
        });

        while !producer.is_finished() {
            if bus_a.is_write_queue_blocked() {
                observed_blocked = true;
            }
            thread::sleep(Duration::from_micros(50));
        }
        producer.join().unwrap();
    });
    assert!(observed_blocked, "the producer never blocked on the byte cap");

    let BusEvent::NewIncomingConnection { .. } = common::next_event(&events_b) else {
        panic!("beta must see the connection event first");
    };
    for seq in 0..MESSAGE_COUNT {
        match common::next_event(&events_b) {
            BusEvent::IncomingMessage { message, .. } => {
                assert_eq!(message.len(), MESSAGE_BYTES, "message {seq}");
                assert_eq!(&message[..2], format!("{seq:02}"), "message {seq}");
            }
            other => panic!("expected message {seq}, got {other:?}"),
        }
    }

    // everything the io loop wrote came out the other side
    assert!(common::wait_until(
        || bus_a.total_bytes_written() == bus_b.total_bytes_read(),
        common::TIMEOUT,
    ));
    assert!(bus_a.total_bytes_written() >= MESSAGE_COUNT * MESSAGE_BYTES);

    bus_a.stop();
    bus_b.stop();
}

//! Heartbeat emission and liveness timeout.

mod common;

use std::time::{Duration, Instant};

use amq_protocol::protocol::connection;
use lepus::{Connection, Error};

use common::{amqp_url, spawn_broker};

#[test]
fn silent_broker_trips_the_liveness_threshold() {
    let (port, broker) = spawn_broker(|broker| {
        broker.handshake(connection::Tune {
            channel_max: 2047,
            frame_max: 131072,
            heartbeat: 1,
        });
        // Fall silent. The client keeps sending heartbeats every interval
        // until its threshold of interval * 3 trips and it hangs up.
        let heartbeats = broker.count_heartbeats_until_eof();
        assert!(heartbeats >= 1, "expected idle-tick heartbeats");
    });

    let connection = Connection::open(&amqp_url(port, "heartbeat=1")).expect("handshake");
    assert_eq!(connection.heartbeat(), 1);

    // Block in channel allocation: the broker never answers Channel.Open,
    // so this waits until the liveness error is pushed at ~3s.
    let started = Instant::now();
    match connection.channel() {
        Err(Error::ConnectionReset(text)) => {
            assert!(text.contains("heartbeat"), "unexpected reset: {text}")
        }
        other => panic!("expected a heartbeat reset, got {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(8),
        "liveness tripped after {elapsed:?}"
    );

    // The queued error is gone; later calls see the closed connection.
    assert!(connection.channel().is_err());
    broker.join().expect("broker thread");
}

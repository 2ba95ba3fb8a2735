//! Connection handshake scenarios against a scripted broker.

mod common;

use amq_protocol::protocol::{connection, AMQPClass};
use amq_protocol::types::FieldTable;
use lepus::{Connection, Error};

use common::{amqp_url, spawn_broker, Broker};

#[test]
fn handshake_happy_path_negotiates_tuned_values() {
    let (port, broker) = spawn_broker(|broker| {
        let tune_ok = broker.handshake(connection::Tune {
            channel_max: 100,
            frame_max: 131072,
            heartbeat: 60,
        });
        // negotiate(min of nonzero): client asked 65535/131072/300
        assert_eq!(tune_ok.channel_max, 100);
        assert_eq!(tune_ok.frame_max, 131072);
        assert_eq!(tune_ok.heartbeat, 60);

        broker.accept_connection_close();
        broker.drain_until_eof();
    });

    let connection = Connection::open(&amqp_url(port, "")).expect("handshake");
    assert_eq!(connection.channel_max(), 100);
    assert_eq!(connection.frame_max(), 131072);
    assert_eq!(connection.heartbeat(), 60);
    connection.close().expect("close");
    broker.join().expect("broker thread");
}

#[test]
fn version_mismatch_aborts_without_start_ok() {
    let (port, broker) = spawn_broker(|broker| {
        broker.expect_protocol_header();
        broker.write_method(
            0,
            AMQPClass::Connection(connection::AMQPMethod::Start(connection::Start {
                version_major: 1,
                version_minor: 0,
                server_properties: FieldTable::default(),
                mechanisms: "PLAIN".into(),
                locales: "en_US".into(),
            })),
        );
        // The client must hang up without answering.
        broker.expect_immediate_eof();
    });

    match Connection::open(&amqp_url(port, "")) {
        Err(Error::ConnectionReset(text)) => {
            assert!(text.contains("version"), "unexpected reset text: {text}")
        }
        other => panic!("expected a connection reset, got {other:?}"),
    }
    broker.join().expect("broker thread");
}

#[test]
fn server_refusing_the_socket_surfaces_an_io_error() {
    // Bind, capture the port, then drop the listener so nothing is there.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    match Connection::open(&amqp_url(port, "timeout=1")) {
        Err(Error::Io(_)) => {}
        other => panic!("expected an IO error, got {other:?}"),
    }
}

#[test]
fn silent_server_times_out_the_handshake() {
    let (port, broker) = spawn_broker(|broker| {
        // Accept the socket but never speak AMQP.
        broker.drain_until_eof();
    });

    match Connection::open(&amqp_url(port, "timeout=1")) {
        Err(Error::ConnectionTimeout(_)) => {}
        other => panic!("expected a handshake timeout, got {other:?}"),
    }
    broker.join().expect("broker thread");
}

#[test]
fn unused_channels_are_not_required_for_close() {
    let (port, broker) = spawn_broker(|broker| {
        broker.handshake(Broker::default_tune());
        broker.accept_connection_close();
        broker.drain_until_eof();
    });

    let connection = Connection::open(&amqp_url(port, "")).expect("handshake");
    // close twice: the second call is a no-op
    connection.close().expect("close");
    connection.close().expect("second close");
    broker.join().expect("broker thread");
}

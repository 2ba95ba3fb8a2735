//! Consuming, acknowledgement and Basic.Get scenarios.

mod common;

use amq_protocol::protocol::basic::AMQPProperties;
use amq_protocol::protocol::{basic, AMQPClass};
use lepus::{Connection, ConsumeOptions, Queue};

use common::{amqp_url, spawn_broker, Broker};

fn no_prefetch() -> ConsumeOptions {
    ConsumeOptions {
        prefetch: None,
        ..ConsumeOptions::default()
    }
}

#[test]
fn consume_yields_deliveries_and_ack_carries_the_tag() {
    let (port, broker) = spawn_broker(|broker| {
        broker.handshake(Broker::default_tune());
        broker.accept_channel_open(1);
        broker.accept_queue_declare(1);
        broker.accept_consume(1, "ctag-1");

        broker.write_content(
            1,
            AMQPClass::Basic(basic::AMQPMethod::Deliver(basic::Deliver {
                consumer_tag: "ctag-1".into(),
                delivery_tag: 7,
                redelivered: false,
                exchange: "".into(),
                routing_key: "work".into(),
            })),
            AMQPProperties::default(),
            b"job payload",
        );

        match broker.read_method() {
            (1, AMQPClass::Basic(basic::AMQPMethod::Ack(ack))) => {
                assert_eq!(ack.delivery_tag, 7);
                assert!(!ack.multiple);
            }
            other => panic!("expected Basic.Ack, got {other:?}"),
        }

        // the explicit cancel
        match broker.read_method() {
            (1, AMQPClass::Basic(basic::AMQPMethod::Cancel(cancel))) => {
                assert_eq!(cancel.consumer_tag.as_str(), "ctag-1");
                broker.write_method(
                    1,
                    AMQPClass::Basic(basic::AMQPMethod::CancelOk(basic::CancelOk {
                        consumer_tag: cancel.consumer_tag,
                    })),
                );
            }
            other => panic!("expected Basic.Cancel, got {other:?}"),
        }

        broker.accept_channel_close(1);
        broker.accept_connection_close();
        broker.drain_until_eof();
    });

    let connection = Connection::open(&amqp_url(port, "")).expect("handshake");
    let channel = connection.channel().expect("channel");
    let mut queue = Queue::new("work");
    queue.declare(&channel).expect("declare");

    let mut consumer = queue.consume(&channel, no_prefetch()).expect("consume");
    assert_eq!(consumer.tag(), "ctag-1");

    let message = consumer
        .next_message()
        .expect("delivery")
        .expect("one message");
    assert_eq!(message.delivery_tag(), Some(7));
    assert_eq!(message.redelivered(), Some(false));
    assert_eq!(message.routing_key(), Some("work"));
    assert_eq!(message.consumer_tag(), Some("ctag-1"));
    assert_eq!(&message.body[..], b"job payload");
    message.ack(false).expect("ack");

    consumer.cancel().expect("cancel");
    channel.close().expect("channel close");
    connection.close().expect("close");
    broker.join().expect("broker thread");
}

#[test]
fn broker_cancel_ends_iteration_cleanly() {
    let (port, broker) = spawn_broker(|broker| {
        broker.handshake(Broker::default_tune());
        broker.accept_channel_open(1);
        broker.accept_queue_declare(1);
        broker.accept_consume(1, "ctag-2");

        // e.g. the queue was deleted: consumer_cancel_notify
        broker.write_method(
            1,
            AMQPClass::Basic(basic::AMQPMethod::Cancel(basic::Cancel {
                consumer_tag: "ctag-2".into(),
                nowait: true,
            })),
        );

        broker.accept_channel_close(1);
        broker.accept_connection_close();
        broker.drain_until_eof();
    });

    let connection = Connection::open(&amqp_url(port, "")).expect("handshake");
    let channel = connection.channel().expect("channel");
    let mut queue = Queue::new("ephemeral");
    queue.declare(&channel).expect("declare");

    let mut consumer = queue.consume(&channel, no_prefetch()).expect("consume");
    assert!(consumer.next_message().expect("clean end").is_none());
    drop(consumer);

    channel.close().expect("channel close");
    connection.close().expect("close");
    broker.join().expect("broker thread");
}

#[test]
fn get_returns_a_message_or_none() {
    let (port, broker) = spawn_broker(|broker| {
        broker.handshake(Broker::default_tune());
        broker.accept_channel_open(1);
        broker.accept_queue_declare(1);

        match broker.read_method() {
            (1, AMQPClass::Basic(basic::AMQPMethod::Get(get))) => {
                assert_eq!(get.queue.as_str(), "inbox");
                assert!(get.no_ack);
            }
            other => panic!("expected Basic.Get, got {other:?}"),
        }
        broker.write_content(
            1,
            AMQPClass::Basic(basic::AMQPMethod::GetOk(basic::GetOk {
                delivery_tag: 3,
                redelivered: true,
                exchange: "".into(),
                routing_key: "inbox".into(),
                message_count: 1,
            })),
            AMQPProperties::default(),
            b"got it",
        );

        match broker.read_method() {
            (1, AMQPClass::Basic(basic::AMQPMethod::Get(_))) => {
                broker.write_method(
                    1,
                    AMQPClass::Basic(basic::AMQPMethod::GetEmpty(basic::GetEmpty {})),
                );
            }
            other => panic!("expected Basic.Get, got {other:?}"),
        }

        broker.accept_channel_close(1);
        broker.accept_connection_close();
        broker.drain_until_eof();
    });

    let connection = Connection::open(&amqp_url(port, "")).expect("handshake");
    let channel = connection.channel().expect("channel");
    let mut queue = Queue::new("inbox");
    queue.declare(&channel).expect("declare");

    let message = queue
        .get(&channel, false)
        .expect("get")
        .expect("a message");
    assert_eq!(message.delivery_tag(), Some(3));
    assert_eq!(message.redelivered(), Some(true));
    assert_eq!(message.message_count(), Some(1));
    assert_eq!(&message.body[..], b"got it");

    assert!(queue.get(&channel, false).expect("get").is_none());

    channel.close().expect("channel close");
    connection.close().expect("close");
    broker.join().expect("broker thread");
}

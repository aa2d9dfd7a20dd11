use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use alertr_lib::message::FrameKind;
use alertr_lib::prelude::*;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use rstest::rstest;

mod helper;
use helper::*;

/// The example from the protocol description.
#[test]
fn ping_example() -> Result<()> {
    better_panic::install();
    let (node, server) = connected();

    let promise = node.send_request(
        "ping",
        r#"{"message":"ping","payload":{"clientTime":1700000000}}"#,
    );
    assert!(promise.is_finished(Duration::from_secs(5)));
    assert!(promise.was_successful());
    assert_eq!(promise.msg_type(), "ping");

    let request = server.recv_request(TIMEOUT).expect("Server should receive the ping");
    assert_eq!(request.state, MsgState::Ok);
    assert_eq!(request.envelope.unwrap().message, "ping");

    Ok(())
}

/// All messages arrive, exactly once and in the order they were sent.
#[test]
fn no_loss_under_success() -> Result<()> {
    better_panic::install();
    let (node, server) = connected();

    for number in 0..20 {
        let promise = node.send_request("sensoralert", &numbered_message(number));
        assert!(promise.was_successful(), "Message {number} failed");
    }

    let received: Vec<u64> = (0..20)
        .map(|_| server.recv_request(TIMEOUT).expect("Missing message"))
        .map(|request| {
            assert_eq!(request.state, MsgState::Ok);
            number_of(&request).unwrap()
        })
        .collect();
    assert_eq!(received, (0..20).collect::<Vec<_>>());
    assert_eq!(server.recv_request(Duration::from_millis(100)), None);

    Ok(())
}

/// Which end of the channel breaks while sending a frame of the given kind.
#[derive(Clone, Copy, Debug)]
enum Side {
    Sender,
    Receiver,
}

/// Every handshake the receiver serviced results in exactly one inbound entry,
/// no matter in which phase the connection broke.
#[rstest]
#[case::rts(FrameKind::Rts, Side::Sender, false)]
#[case::cts(FrameKind::Cts, Side::Receiver, true)]
#[case::request(FrameKind::Request, Side::Sender, true)]
#[case::response(FrameKind::Response, Side::Receiver, true)]
fn attempt_outcome_parity(
    #[case] phase: FrameKind,
    #[case] side: Side,
    #[case] serviced: bool,
) -> Result<()> {
    better_panic::install();
    let (node, server) = unconnected();
    let failing_attempts = [2, 5, 6];

    let mut faults = rearm(&node, &server)?;
    let mut succeeded = Vec::new();
    for attempt in 0..10 {
        if !node.has_channel() {
            faults = rearm(&node, &server)?;
        }

        let should_fail = failing_attempts.contains(&attempt);
        if should_fail {
            match side {
                Side::Sender => faults.0.fail_next(phase),
                Side::Receiver => faults.1.fail_next(phase),
            }
        }

        let promise = node.send_request("sensoralert", &numbered_message(attempt));
        assert_eq!(
            promise.was_successful(),
            !should_fail,
            "Unexpected outcome of attempt {attempt}"
        );

        if should_fail {
            // Both sides notice the broken channel.
            assert!(wait_for(|| !node.has_channel() && !server.has_channel()));
        } else {
            succeeded.push(attempt);
        }
    }

    let requests = drain(&server);
    let errors = requests
        .iter()
        .filter(|request| request.state == MsgState::Error)
        .count();
    let received: Vec<u64> = requests
        .iter()
        .filter(|request| request.is_ok())
        .filter_map(number_of)
        .collect();

    assert_eq!(received, succeeded);
    let expected_errors = if serviced { failing_attempts.len() } else { 0 };
    assert_eq!(errors, expected_errors);
    assert_eq!(requests.len(), succeeded.len() + expected_errors);

    Ok(())
}

/// Concurrent senders never have more than one handshake in flight.
#[test]
fn mutual_exclusion() -> Result<()> {
    better_panic::install();
    let (node, server) = connected();
    let node = Arc::new(node);

    let handles: Vec<_> = (0..8)
        .map(|thread_number| {
            let node = node.clone();
            thread::spawn(move || {
                (0..5)
                    .map(|index| {
                        node.send_request("sensoralert", &numbered_message(thread_number * 10 + index))
                    })
                    .all(|promise| promise.was_successful())
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }

    assert_eq!(node.max_concurrent_handshakes(), 1);
    let received = drain(&server);
    assert_eq!(received.len(), 40);
    assert!(received.iter().all(MsgRequest::is_ok));

    Ok(())
}

/// Spawn `count` threads that each send a single ping.
fn concurrent_pings(communication: &Arc<Communication>, count: u64) -> Vec<thread::JoinHandle<bool>> {
    (0..count)
        .map(|number| {
            let communication = communication.clone();
            thread::spawn(move || {
                communication
                    .send_request("ping", &numbered_message(number))
                    .was_successful()
            })
        })
        .collect()
}

/// Both sides sending at the same time still completes every message.
#[test]
fn bidirectional_fairness() -> Result<()> {
    better_panic::install();
    let (node, server) = connected();
    let node = Arc::new(node);
    let server = Arc::new(server);

    let start = Instant::now();
    let mut handles = concurrent_pings(&node, 30);
    handles.extend(concurrent_pings(&server, 30));

    for handle in handles {
        assert!(handle.join().unwrap(), "A ping failed");
    }
    assert!(start.elapsed() < Duration::from_secs(30));

    for communication in [&node, &server] {
        let mut numbers: Vec<u64> = drain(communication)
            .iter()
            .filter(|request| request.is_ok())
            .filter_map(number_of)
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (0..30).collect::<Vec<_>>());
    }

    Ok(())
}

/// Each direction keeps its order, while both directions are busy.
#[test]
fn ordering_per_direction() -> Result<()> {
    better_panic::install();
    let (node, server) = connected();
    let node = Arc::new(node);
    let server = Arc::new(server);

    let sequential = |communication: Arc<Communication>| {
        thread::spawn(move || {
            (0..30).all(|number| {
                communication
                    .send_request("sensoralert", &numbered_message(number))
                    .was_successful()
            })
        })
    };
    let node_sender = sequential(node.clone());
    let server_sender = sequential(server.clone());
    assert!(node_sender.join().unwrap());
    assert!(server_sender.join().unwrap());

    for communication in [&node, &server] {
        let numbers: Vec<u64> = drain(communication).iter().filter_map(number_of).collect();
        assert_eq!(numbers, (0..30).collect::<Vec<_>>());
    }

    Ok(())
}

/// Once disconnected, nothing blocks any longer.
#[test]
fn post_failure_fast_path() -> Result<()> {
    better_panic::install();
    let (node, server) = connected();

    server.close();
    assert!(wait_for(|| !node.has_channel()));

    let start = Instant::now();
    let promise = node.send_request("ping", &numbered_message(0));
    assert_eq!(promise.state(), PromiseState::Failed);
    assert_eq!(node.recv_request(Duration::from_secs(10)), None);
    assert!(start.elapsed() < Duration::from_secs(1));

    Ok(())
}

/// Handshakes that are stuck on a dead channel fail, once a new channel is armed.
/// Afterwards everything works like on a fresh instance.
#[test]
fn rearm_after_failure() -> Result<()> {
    better_panic::install();
    let (node, server) = unconnected();
    let node = Arc::new(node);

    // The server never arms its end, so the node's rts is never answered.
    let (node_channel, server_channel) = alertr_lib::channel::memory::pair();
    node.install_channel(Box::new(node_channel))?;
    node.set_connected()?;
    server.install_channel(Box::new(server_channel))?;

    let stuck_node = node.clone();
    let stuck = thread::spawn(move || stuck_node.send_request("ping", &numbered_message(0)));
    thread::sleep(Duration::from_millis(100));

    rearm(&node, &server)?;
    let stale_promise = stuck.join().unwrap();
    assert_eq!(stale_promise.state(), PromiseState::Failed);

    // Arming twice doesn't change anything.
    node.set_connected()?;
    server.set_connected()?;

    for number in 1..4 {
        assert!(node.send_request("sensoralert", &numbered_message(number)).was_successful());
        assert!(server.send_request("sensoralert", &numbered_message(number)).was_successful());
    }

    let numbers: Vec<u64> = drain(&server).iter().filter_map(number_of).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    let numbers: Vec<u64> = drain(&node).iter().filter_map(number_of).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    Ok(())
}

/// Messages that have been lingering for too long are reported as expired on both sides.
#[test]
fn expired_message() -> Result<()> {
    better_panic::install();
    let (node, server) = connected();

    let promise = node.send_request(
        "statechange",
        r#"{"msgTime":1000,"message":"statechange","payload":{}}"#,
    );
    assert_eq!(promise.state(), PromiseState::Failed);
    assert!(node.has_channel());

    let request = server.recv_request(TIMEOUT).unwrap();
    assert_eq!(request.state, MsgState::Expired);
    assert_eq!(request.envelope.unwrap().msg_time, Some(1000));

    Ok(())
}

#[test]
fn invalid_envelope_fails_without_io() -> Result<()> {
    better_panic::install();
    let (node, server) = connected();

    let promise = node.send_request("ping", "this isn't json");
    assert_eq!(promise.state(), PromiseState::Failed);
    assert_eq!(node.max_concurrent_handshakes(), 0);
    assert_eq!(server.recv_request(Duration::from_millis(100)), None);

    Ok(())
}

/// A peer that doesn't answer lets the handshake time out, but the channel stays usable.
#[test]
fn handshake_timeout_keeps_channel() -> Result<()> {
    better_panic::install();
    let node = Communication::new(CommunicationConfig {
        handshake_timeout: Duration::from_millis(200),
        ..fast_config(false)
    });

    let (node_channel, peer_channel) = alertr_lib::channel::memory::pair();
    node.install_channel(Box::new(node_channel))?;
    node.set_connected()?;
    // Keep the peer alive without ever answering.
    let (_peer_reader, _peer_writer) = (Box::new(peer_channel) as Box<dyn ByteChannel>).split()?;

    let promise = node.send_request("ping", &numbered_message(0));
    assert_eq!(promise.state(), PromiseState::Failed);
    assert!(node.has_channel());

    Ok(())
}

//! Integration tests for the streaming engine
//!
//! Drives full runs through `Streamer` against `MockTransport`, covering:
//! - queue fill and resubmission accounting
//! - stop, drain and pool release
//! - start-time failures and busy starts
//! - duration-limited runs and statistics subscribers

use std::sync::Arc;
use std::time::{Duration, Instant};
use streamer::test_utils::{DEFAULT_TEST_TIMEOUT, MockTransport, wait_until};
use streamer::transport::{PacketOutcome, TransferStatus};
use streamer::{RunConfig, StartError, Streamer, TransferType, TransportError};

fn bulk(depth: usize) -> RunConfig {
    RunConfig::new(0x81, TransferType::Bulk, 512)
        .with_request_size(4)
        .with_queue_depth(depth)
}

fn streamer_with(transport: &MockTransport, config: RunConfig) -> Streamer<MockTransport> {
    let streamer = Streamer::new(Arc::new(transport.clone()));
    streamer.configure(config).unwrap();
    streamer
}

/// Wait until `count` requests succeeded and the queue is full again
fn wait_for_successes(streamer: &Streamer<MockTransport>, count: u64, depth: usize) -> bool {
    wait_until(DEFAULT_TEST_TIMEOUT, || {
        let snapshot = streamer.snapshot();
        snapshot.success_count == count && snapshot.in_flight == depth
    })
}

/// Stop a manual-mode run and wait for it to finish
fn stop_and_drain(streamer: &Streamer<MockTransport>, transport: &MockTransport) {
    streamer.request_stop();
    transport.complete_all();
    streamer.wait();
}

mod queue {
    use super::*;

    #[test]
    fn test_queue_full_after_start() {
        let transport = MockTransport::manual();
        let streamer = streamer_with(&transport, bulk(8));

        streamer.start().unwrap();
        assert!(streamer.is_running());
        assert_eq!(streamer.snapshot().in_flight, 8);
        assert_eq!(transport.pending(), 8);
        assert_eq!(transport.allocated(), 8);

        stop_and_drain(&streamer, &transport);
    }

    #[test]
    fn test_completions_are_resubmitted() {
        let transport = MockTransport::manual();
        let streamer = streamer_with(&transport, bulk(4));
        streamer.start().unwrap();

        transport.complete(10);
        assert!(wait_for_successes(&streamer, 10, 4));

        let snapshot = streamer.snapshot();
        assert_eq!(snapshot.in_flight, 4);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.total_bytes, 10 * 4 * 512);
        assert_eq!(transport.submitted(), 14);

        stop_and_drain(&streamer, &transport);
    }

    #[test]
    fn test_failures_are_counted_and_run_continues() {
        let transport = MockTransport::manual();
        transport.set_status(TransferStatus::TimedOut);
        let streamer = streamer_with(&transport, bulk(2));
        streamer.start().unwrap();

        transport.complete(5);
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            let snapshot = streamer.snapshot();
            snapshot.failure_count == 5 && snapshot.in_flight == 2
        }));

        let snapshot = streamer.snapshot();
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.total_bytes, 0);
        assert_eq!(snapshot.in_flight, 2);
        assert!(streamer.is_running());

        stop_and_drain(&streamer, &transport);
    }

    #[test]
    fn test_isochronous_packets_are_accounted() {
        let transport = MockTransport::manual();
        transport.set_iso_outcome(vec![
            PacketOutcome {
                status: TransferStatus::Completed,
                actual_length: 100,
            },
            PacketOutcome {
                status: TransferStatus::Completed,
                actual_length: 50,
            },
            PacketOutcome {
                status: TransferStatus::Error,
                actual_length: 0,
            },
        ]);
        let config = RunConfig::new(0x83, TransferType::Isochronous, 1024)
            .with_request_size(3)
            .with_queue_depth(2);
        let streamer = streamer_with(&transport, config);
        streamer.start().unwrap();

        transport.complete(1);
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            streamer.snapshot().success_count == 1
        }));
        let snapshot = streamer.snapshot();
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.total_bytes, 150);

        let descriptor = transport.last_descriptor().unwrap();
        assert_eq!(descriptor.iso_packets.len(), 3);
        assert_eq!(descriptor.length, 3 * 1024);

        stop_and_drain(&streamer, &transport);
    }
}

mod shutdown {
    use super::*;

    #[test]
    fn test_no_resubmission_after_stop() {
        let transport = MockTransport::manual();
        let streamer = streamer_with(&transport, bulk(4));
        streamer.start().unwrap();
        let submitted = transport.submitted();

        streamer.request_stop();
        // The run stays active until every request has drained
        assert!(streamer.is_running());

        let context = streamer.context();
        let mut last = context.stats.in_flight();
        for _ in 0..4 {
            transport.complete(1);
            assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
                context.stats.in_flight() < last
            }));
            let now = context.stats.in_flight();
            assert!(now < last);
            last = now;
        }

        streamer.wait();
        assert_eq!(transport.submitted(), submitted);
        assert_eq!(context.stats.in_flight(), 0);
        assert!(!streamer.is_running());
    }

    #[test]
    fn test_unanswered_requests_drain_by_timeout() {
        let timeout = Duration::from_millis(200);
        let transport = MockTransport::unresponsive();
        let streamer = streamer_with(&transport, bulk(4).with_transfer_timeout(timeout));
        streamer.start().unwrap();
        assert_eq!(streamer.snapshot().in_flight, 4);

        let stopped_at = Instant::now();
        streamer.request_stop();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !streamer.is_running()));
        let drained_in = stopped_at.elapsed();
        assert!(
            drained_in < timeout * 3,
            "drain took {:?} with a {:?} transfer timeout",
            drained_in,
            timeout
        );

        streamer.wait();
        let snapshot = streamer.snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.failure_count, 4);
        assert_eq!(transport.submitted(), 4);
        assert_eq!(transport.freed(), 4);
    }

    #[test]
    fn test_pool_released_exactly_once() {
        let transport = MockTransport::manual();
        let streamer = streamer_with(&transport, bulk(6));
        streamer.start().unwrap();

        stop_and_drain(&streamer, &transport);
        assert_eq!(transport.freed(), 6);

        // Dropping the stopped streamer frees nothing further
        drop(streamer);
        assert_eq!(transport.freed(), 6);
    }

    #[test]
    fn test_stats_survive_the_run() {
        let transport = MockTransport::manual();
        let streamer = streamer_with(&transport, bulk(2));
        streamer.start().unwrap();

        transport.complete(3);
        assert!(wait_for_successes(&streamer, 3, 2));
        stop_and_drain(&streamer, &transport);

        let snapshot = streamer.snapshot();
        assert_eq!(snapshot.success_count, 5);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[test]
    fn test_duration_stops_run() {
        let transport = MockTransport::new();
        let config = bulk(4)
            .with_duration(Some(Duration::from_millis(100)))
            .with_refresh_interval(Duration::from_millis(20));
        let streamer = streamer_with(&transport, config);

        streamer.start().unwrap();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !streamer.is_running()));
        streamer.wait();

        let snapshot = streamer.snapshot();
        assert!(snapshot.success_count > 0);
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(transport.freed(), 4);
    }

    #[test]
    fn test_restart_after_stop() {
        let transport = MockTransport::manual();
        let streamer = streamer_with(&transport, bulk(3));

        streamer.start().unwrap();
        transport.complete(2);
        assert!(wait_for_successes(&streamer, 2, 3));
        streamer.request_stop();
        transport.complete(3);
        streamer.wait();

        // Second run starts from zeroed statistics with a fresh pool
        streamer.start().unwrap();
        let snapshot = streamer.snapshot();
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.in_flight, 3);
        assert_eq!(transport.sessions(), 2);

        stop_and_drain(&streamer, &transport);
        assert_eq!(transport.freed(), 6);
    }
}

mod start_failures {
    use super::*;

    #[test]
    fn test_start_while_running_is_busy() {
        let transport = MockTransport::manual();
        let streamer = streamer_with(&transport, bulk(4));
        streamer.start().unwrap();

        transport.complete(2);
        assert!(wait_for_successes(&streamer, 2, 4));
        let before = streamer.snapshot();

        let err = streamer.start().unwrap_err();
        assert!(err.is_busy());
        assert_eq!(streamer.snapshot(), before);
        assert_eq!(transport.sessions(), 1);
        assert_eq!(transport.allocated(), 4);

        stop_and_drain(&streamer, &transport);
    }

    #[test]
    fn test_session_open_failure() {
        let transport = MockTransport::manual();
        transport.fail_session_open();
        let streamer = streamer_with(&transport, bulk(4));

        match streamer.start() {
            Err(StartError::Session(TransportError::NoDevice)) => {}
            other => panic!("unexpected start result: {:?}", other),
        }
        assert!(!streamer.is_running());
        assert_eq!(transport.allocated(), 0);
    }

    #[test]
    fn test_allocation_failure_releases_everything() {
        let transport = MockTransport::manual();
        transport.fail_allocation_at(3);
        let streamer = streamer_with(&transport, bulk(8));

        assert!(matches!(streamer.start(), Err(StartError::Allocation(_))));
        assert!(!streamer.is_running());
        assert_eq!(transport.allocated(), 3);
        assert_eq!(transport.freed(), 3);
        assert_eq!(transport.submitted(), 0);
    }

    #[test]
    fn test_all_submissions_rejected() {
        let transport = MockTransport::manual();
        transport.reject_submissions_after(0);
        let streamer = streamer_with(&transport, bulk(4));

        match streamer.start() {
            Err(StartError::Submission { queue_depth, last }) => {
                assert_eq!(queue_depth, 4);
                assert_eq!(last, TransportError::Busy);
            }
            other => panic!("unexpected start result: {:?}", other),
        }
        assert!(!streamer.is_running());
        assert_eq!(streamer.snapshot().in_flight, 0);
        assert_eq!(transport.freed(), 4);
    }

    #[test]
    fn test_start_possible_right_after_failure() {
        let transport = MockTransport::manual();
        transport.fail_session_open();
        let streamer = streamer_with(&transport, bulk(2));

        assert!(streamer.start().is_err());
        streamer.start().unwrap();
        assert_eq!(streamer.snapshot().in_flight, 2);

        stop_and_drain(&streamer, &transport);
    }
}

mod observers {
    use super::*;

    #[test]
    fn test_subscriber_receives_refreshes() {
        let transport = MockTransport::new();
        let config = bulk(2)
            .with_duration(Some(Duration::from_millis(150)))
            .with_refresh_interval(Duration::from_millis(10));
        let streamer = streamer_with(&transport, config);
        let updates = streamer.subscribe();

        streamer.start().unwrap();
        streamer.wait();

        let mut received = Vec::new();
        while let Ok(snapshot) = updates.try_recv() {
            received.push(snapshot);
        }
        assert!(!received.is_empty());
        assert!(
            received
                .windows(2)
                .all(|pair| pair[0].success_count <= pair[1].success_count)
        );
    }

    #[test]
    fn test_dropped_subscriber_does_not_stall_run() {
        let transport = MockTransport::new();
        let config = bulk(2)
            .with_duration(Some(Duration::from_millis(80)))
            .with_refresh_interval(Duration::from_millis(5));
        let streamer = streamer_with(&transport, config);
        drop(streamer.subscribe());

        streamer.start().unwrap();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !streamer.is_running()));
    }
}

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Property: a full run never leaks or double frees a slot
        #[test]
        fn prop_every_slot_released_once(
            depth in 1usize..=32,
            request_size in 1usize..=16,
            completions in 0usize..64,
        ) {
            let transport = MockTransport::manual();
            let streamer = streamer_with(&transport, bulk(depth).with_request_size(request_size));
            streamer.start().unwrap();
            prop_assert_eq!(streamer.snapshot().in_flight, depth);

            transport.complete(completions);
            prop_assert!(wait_for_successes(&streamer, completions as u64, depth));

            stop_and_drain(&streamer, &transport);
            prop_assert_eq!(transport.freed(), depth);
            prop_assert_eq!(transport.allocated(), depth);
            prop_assert_eq!(
                streamer.snapshot().success_count,
                (completions + depth) as u64
            );
        }
    }
}

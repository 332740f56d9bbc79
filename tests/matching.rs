use std::thread;

use mpi_match::datatype::{BufferDesc, Datatype, Equivalence, Format};
use mpi_match::endpoint::Endpoint;
use mpi_match::envelope::{Envelope, MatchKey, SendHandle};
use mpi_match::environment::Universe;
use mpi_match::queue::{ElementInfo, QueueId};
use mpi_match::traits::*;
use mpi_match::transport::{Payload, PollMode};
use mpi_match::{ErrorKind, Rank, Tag, ANY_SOURCE, ANY_TAG, MSG_CANCELLED};
use simple_logger::SimpleLogger;

fn init_logging() {
    let _ = SimpleLogger::new().with_level(log::LevelFilter::Warn).init();
}

fn endpoint() -> Endpoint {
    init_logging();
    Endpoint::builder(0).build().unwrap()
}

fn arrive(endpoint: &Endpoint, context: u32, tag: Tag, source: Rank, id: u64, data: &[u8]) {
    let envelope = Envelope {
        key: MatchKey::new(context, tag, source),
        len: data.len(),
        format: Format::native(),
        sender: SendHandle { origin: source, id },
    };
    endpoint
        .incoming(envelope, Payload::Eager(data.to_vec()))
        .unwrap();
}

fn elements(endpoint: &Endpoint, queue: QueueId) -> Vec<ElementInfo> {
    let mut seen = Vec::new();
    endpoint.inspect(queue, &mut |e: &ElementInfo| seen.push(*e));
    seen
}

#[test]
fn posted_receive_gets_arrival() {
    let ep = endpoint();
    let request = ep
        .immediate_receive_contig(MatchKey::new(0, 7, 2), 16)
        .unwrap();
    assert_eq!(ep.queue_len(QueueId::Posted), 1);

    arrive(&ep, 0, 7, 2, 1, b"abc");

    let received = request.wait();
    let status = received.status();
    assert_eq!(status.source_rank(), 2);
    assert_eq!(status.tag(), 7);
    assert_eq!(status.byte_count(), 3);
    assert_eq!(status.error(), ErrorKind::Success);
    assert_eq!(&received.bytes()[..3], b"abc");
    assert_eq!(ep.queue_len(QueueId::Posted), 0);
    assert_eq!(ep.queue_len(QueueId::Unexpected), 0);
}

#[test]
fn unexpected_arrival_is_delivered_on_post() {
    let ep = endpoint();
    arrive(&ep, 0, 7, 2, 1, b"abc");
    assert_eq!(ep.queue_len(QueueId::Unexpected), 1);

    let request = ep
        .immediate_receive_contig(MatchKey::new(0, 7, ANY_SOURCE), 16)
        .unwrap();
    let received = request.test().expect("delivered while posting");
    assert_eq!(received.status().source_rank(), 2);
    assert_eq!(&received.bytes()[..3], b"abc");
    assert_eq!(ep.queue_len(QueueId::Unexpected), 0);
    assert_eq!(ep.queue_len(QueueId::Posted), 0);
}

#[test]
fn earliest_posted_receive_wins() {
    let ep = endpoint();
    let r1 = ep
        .immediate_receive_contig(MatchKey::new(0, ANY_TAG, 2), 4)
        .unwrap();
    let r2 = ep.immediate_receive_contig(MatchKey::new(0, 7, 2), 4).unwrap();

    arrive(&ep, 0, 7, 2, 1, b"x");

    let received = r1.test().expect("first receive matched");
    assert_eq!(received.status().tag(), 7);
    let r2 = r2.test().expect_err("second receive still posted");
    assert_eq!(ep.queue_len(QueueId::Posted), 1);
    assert_eq!(elements(&ep, QueueId::Posted)[0].request, r2.id());
    r2.cancel().unwrap();
}

#[test]
fn earliest_arrival_wins() {
    let ep = endpoint();
    arrive(&ep, 0, 7, 2, 1, b"aa");
    arrive(&ep, 0, 7, 2, 2, b"bb");

    let received = ep.receive_contig(MatchKey::new(0, 7, 2), 2).unwrap();
    assert_eq!(received.bytes(), b"aa");
    assert_eq!(ep.queue_len(QueueId::Unexpected), 1);

    let received = ep.receive_contig(MatchKey::new(0, 7, 2), 2).unwrap();
    assert_eq!(received.bytes(), b"bb");
}

#[test]
fn truncation_keeps_whole_elements() {
    let ep = endpoint();
    let buffer = BufferDesc::new(2, u32::equivalent_datatype()).unwrap();
    let request = ep
        .immediate_receive_datatype(MatchKey::new(0, 3, 1), buffer)
        .unwrap();

    let payload: Vec<u8> = [10u32, 20, 30]
        .iter()
        .flat_map(|v| v.to_ne_bytes())
        .collect();
    arrive(&ep, 0, 3, 1, 1, &payload);

    let received = request.wait();
    assert_eq!(received.status().source_rank(), 1);
    assert_eq!(received.status().tag(), 3);
    assert_eq!(received.status().byte_count(), 8);
    assert_eq!(received.status().error(), ErrorKind::Truncate);
    let mut values = [0u32; 2];
    received.copy_into(&mut values[..]);
    assert_eq!(values, [10, 20]);
}

#[test]
fn truncation_rounds_down_to_elements() {
    let ep = endpoint();
    let request = ep
        .immediate_receive_datatype(
            MatchKey::new(0, 3, 1),
            BufferDesc::new(2, u32::equivalent_datatype()).unwrap(),
        )
        .unwrap();
    arrive(&ep, 0, 3, 1, 1, &[1, 0, 0, 0, 2, 0, 0]);
    // seven bytes fit into eight, nothing to truncate
    let received = request.wait();
    assert_eq!(received.status().error(), ErrorKind::Success);
    assert_eq!(received.status().byte_count(), 7);

    let request = ep
        .immediate_receive_datatype(
            MatchKey::new(0, 3, 1),
            BufferDesc::new(1, u16::equivalent_datatype()).unwrap(),
        )
        .unwrap();
    arrive(&ep, 0, 3, 1, 2, &[1, 2, 3]);
    let received = request.wait();
    assert_eq!(received.status().error(), ErrorKind::Truncate);
    assert_eq!(received.status().byte_count(), 2);
    assert_eq!(received.status().count(&u16::equivalent_datatype()), 1);
}

#[test]
fn cancelled_receive_reports_sentinel_tag() {
    let ep = endpoint();
    let request = ep
        .immediate_receive_contig(MatchKey::new(0, 1, ANY_SOURCE), 8)
        .unwrap();
    request.cancel().unwrap();

    let received = request.test().expect("cancel completes locally");
    assert_eq!(received.status().tag(), MSG_CANCELLED);
    assert_eq!(received.status().error(), ErrorKind::Cancelled);
    assert!(received.status().clone().into_result().is_err());

    // a later arrival no longer sees the cancelled receive
    arrive(&ep, 0, 1, 4, 1, b"late");
    assert_eq!(ep.queue_len(QueueId::Unexpected), 1);
}

#[test]
fn cancel_after_completion_is_a_no_op() {
    let ep = endpoint();
    let request = ep.immediate_receive_contig(MatchKey::new(0, 1, 1), 8).unwrap();
    arrive(&ep, 0, 1, 1, 1, b"done");
    request.cancel().unwrap();
    request.cancel().unwrap();
    let received = request.wait();
    assert_eq!(received.status().error(), ErrorKind::Success);
    assert_eq!(&received.bytes()[..4], b"done");
}

#[test]
fn cancel_restores_queue_state() {
    let ep = endpoint();
    let before = ep
        .immediate_receive_contig(MatchKey::new(0, 1, 1), 8)
        .unwrap();
    let snapshot = elements(&ep, QueueId::Posted);

    let extra = ep.immediate_receive_contig(MatchKey::new(0, 2, 1), 8).unwrap();
    extra.cancel().unwrap();
    assert_eq!(elements(&ep, QueueId::Posted), snapshot);

    arrive(&ep, 0, 1, 1, 1, b"x");
    assert_eq!(before.wait().status().byte_count(), 1);
}

#[test]
fn distinct_messages_reach_their_receives() {
    init_logging();
    const N: i32 = 32;
    let universe = Universe::new(2).unwrap();
    let (a, b) = (universe.endpoint(0).unwrap(), universe.endpoint(1).unwrap());

    thread::scope(|scope| {
        scope.spawn(|| {
            for tag in 0..N {
                let msg = [tag, tag * 2];
                a.process_at_rank(1).send_with_tag(&msg[..], tag).unwrap();
            }
        });
        scope.spawn(|| {
            for tag in (0..N).rev() {
                let mut msg = [0i32; 2];
                let status = b
                    .process_at_rank(0)
                    .receive_into_with_tag(&mut msg[..], tag)
                    .unwrap();
                assert_eq!(status.source_rank(), 0);
                assert_eq!(status.tag(), tag);
                assert_eq!(status.error(), ErrorKind::Success);
                assert_eq!(msg, [tag, tag * 2]);
            }
        });
    });
    assert_eq!(b.queue_len(QueueId::Unexpected), 0);
}

#[test]
fn wildcard_source_takes_the_earlier_arrival() {
    let ep = endpoint();
    arrive(&ep, 0, 5, 1, 1, b"one");
    arrive(&ep, 0, 5, 2, 1, b"two");

    let first = ep
        .receive_contig(MatchKey::new(0, 5, ANY_SOURCE), 8)
        .unwrap();
    assert_eq!(first.status().source_rank(), 1);
    assert_eq!(&first.bytes()[..3], b"one");

    let left = elements(&ep, QueueId::Unexpected);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].source, 2);

    let second = ep
        .receive_contig(MatchKey::new(0, 5, ANY_SOURCE), 8)
        .unwrap();
    assert_eq!(second.status().source_rank(), 2);
}

#[test]
fn concurrent_arrivals_are_each_delivered_once() {
    init_logging();
    const PER_SOURCE: u64 = 50;
    let ep = Endpoint::builder(0).build().unwrap();

    let mut seen = Vec::new();
    thread::scope(|scope| {
        for source in 1..=2 {
            let ep = &ep;
            scope.spawn(move || {
                for i in 0..PER_SOURCE {
                    let data = [source as u8, i as u8];
                    arrive(ep, 0, 9, source, i, &data);
                }
            });
        }
        for _ in 0..2 * PER_SOURCE {
            let received = ep
                .receive_contig(MatchKey::new(0, 9, ANY_SOURCE), 2)
                .unwrap();
            seen.push((received.bytes()[0], received.bytes()[1]));
        }
    });

    // per source the messages come out in arrival order
    for source in 1..=2u8 {
        let order: Vec<u8> = seen
            .iter()
            .filter(|(s, _)| *s == source)
            .map(|&(_, i)| i)
            .collect();
        assert_eq!(order, (0..PER_SOURCE as u8).collect::<Vec<_>>());
    }
    assert_eq!(ep.queue_len(QueueId::Unexpected), 0);
}

#[test]
fn immediate_probe_leaves_queues_alone() {
    let ep = endpoint();
    assert_eq!(
        ep.immediate_probe(MatchKey::new(0, ANY_TAG, ANY_SOURCE))
            .unwrap(),
        None
    );
    arrive(&ep, 0, 4, 3, 1, b"probe");
    let snapshot = elements(&ep, QueueId::Unexpected);

    let status = ep
        .immediate_probe(MatchKey::new(0, ANY_TAG, 3))
        .unwrap()
        .expect("message is there");
    assert_eq!(status.tag(), 4);
    assert_eq!(status.byte_count(), 5);
    assert_eq!(elements(&ep, QueueId::Unexpected), snapshot);

    // probing twice sees the same message until it is received
    let again = ep.probe(MatchKey::new(0, 4, ANY_SOURCE)).unwrap();
    assert_eq!(again, status);
    let received = ep.receive_contig(MatchKey::new(0, 4, 3), 8).unwrap();
    assert_eq!(&received.bytes()[..5], b"probe");
    assert_eq!(
        ep.immediate_probe(MatchKey::new(0, 4, 3)).unwrap(),
        None
    );
}

#[test]
fn blocking_probe_waits_for_arrival() {
    let ep = endpoint();
    thread::scope(|scope| {
        scope.spawn(|| arrive(&ep, 0, 8, 6, 1, b"later"));
        let status = ep.probe(MatchKey::new(0, 8, 6)).unwrap();
        assert_eq!(status.source_rank(), 6);
    });
}

#[test]
fn zero_length_receives() {
    let ep = endpoint();
    arrive(&ep, 0, 1, 1, 1, b"");
    let received = ep
        .receive_contig(MatchKey::new(0, ANY_TAG, ANY_SOURCE), 0)
        .unwrap();
    assert_eq!(received.status().error(), ErrorKind::Success);
    assert_eq!(received.status().byte_count(), 0);

    arrive(&ep, 0, 1, 1, 2, b"x");
    let received = ep
        .receive_contig(MatchKey::new(0, ANY_TAG, ANY_SOURCE), 0)
        .unwrap();
    assert_eq!(received.status().error(), ErrorKind::Truncate);
    assert_eq!(received.status().byte_count(), 0);
}

#[test]
fn full_wildcard_respects_context() {
    let ep = endpoint();
    arrive(&ep, 1, 3, 3, 1, b"other");
    arrive(&ep, 0, 2, 2, 1, b"first");
    arrive(&ep, 0, 1, 1, 1, b"second");

    let received = ep
        .receive_contig(MatchKey::new(0, ANY_TAG, ANY_SOURCE), 8)
        .unwrap();
    assert_eq!(&received.bytes()[..5], b"first");

    let left = elements(&ep, QueueId::Unexpected);
    assert_eq!(left.len(), 2);
    assert_eq!(left[0].context, 1);
}

#[test]
fn invalid_arguments_are_rejected() {
    let ep = endpoint();
    assert_eq!(
        ep.immediate_receive_contig(MatchKey::new(0, 0, -7), 1)
            .unwrap_err()
            .kind(),
        ErrorKind::Rank
    );
    let null = BufferDesc::null(3, u32::equivalent_datatype());
    assert_eq!(
        ep.immediate_receive_datatype(MatchKey::new(0, 0, 0), null)
            .unwrap_err()
            .kind(),
        ErrorKind::Buffer
    );
    let empty = BufferDesc::null(0, Datatype::packed());
    let request = ep
        .immediate_receive_datatype(MatchKey::new(0, 0, 0), empty)
        .unwrap();
    request.cancel().unwrap();
    assert_eq!(ep.queue_len(QueueId::Posted), 0);
}

#[test]
fn exhausted_slab_fails_the_arrival() {
    init_logging();
    let config = mpi_match::environment::Config::default()
        .with_element_slab_initial(1)
        .with_element_slab_growth(1)
        .with_element_slab_limit(Some(2));
    let ep = Endpoint::builder(0).config(config).build().unwrap();
    arrive(&ep, 0, 1, 1, 1, b"a");
    arrive(&ep, 0, 1, 1, 2, b"b");
    let envelope = Envelope {
        key: MatchKey::new(0, 1, 1),
        len: 1,
        format: Format::native(),
        sender: SendHandle { origin: 1, id: 3 },
    };
    let err = ep
        .incoming(envelope, Payload::Eager(b"c".to_vec()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exhausted);

    let received = ep.receive_contig(MatchKey::new(0, 1, 1), 1).unwrap();
    assert_eq!(received.bytes(), b"a");
    arrive(&ep, 0, 1, 1, 4, b"d");
    assert_eq!(ep.queue_len(QueueId::Unexpected), 2);
}

#[test]
fn concurrent_pollers_keep_sender_order() {
    const MESSAGES: u32 = 5000;
    init_logging();
    let universe = Universe::new(2).unwrap();
    let a = universe.endpoint(0).unwrap();
    let b = universe.endpoint(1).unwrap();

    thread::scope(|scope| {
        scope.spawn(|| {
            for value in 0..MESSAGES {
                a.process_at_rank(1).send_with_tag(&[value][..], 3).unwrap();
            }
        });
        for _ in 0..4 {
            scope.spawn(|| {
                while b.queue_len(QueueId::Unexpected) < MESSAGES as usize {
                    b.progress(PollMode::NonBlocking);
                }
            });
        }
    });

    for expected in 0..MESSAGES {
        let (value, status) = b.process_at_rank(0).receive_with_tag::<u32>(3).unwrap();
        assert_eq!(status.error(), ErrorKind::Success);
        assert_eq!(value, expected);
    }
    assert_eq!(b.queue_len(QueueId::Unexpected), 0);
}

#[test]
fn receive_vec_sizes_each_message_from_its_probe() {
    init_logging();
    let universe = Universe::new(2).unwrap();
    let a = universe.endpoint(0).unwrap();
    let b = universe.endpoint(1).unwrap();
    a.process_at_rank(1).send_with_tag(&[1u16, 2][..], 4).unwrap();
    a.process_at_rank(1).send_with_tag(&[3u16, 4, 5, 6, 7][..], 4).unwrap();

    let (first, status) = b.process_at_rank(0).receive_vec_with_tag::<u16>(4).unwrap();
    assert_eq!(first, vec![1, 2]);
    assert_eq!(status.error(), ErrorKind::Success);
    let (second, status) = b.any_process().receive_vec::<u16>().unwrap();
    assert_eq!(second, vec![3, 4, 5, 6, 7]);
    assert_eq!(status.byte_count(), 10);
}

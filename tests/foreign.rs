use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use mpi_match::datatype::Format;
use mpi_match::endpoint::Endpoint;
use mpi_match::envelope::{Envelope, MatchKey, SendHandle};
use mpi_match::queue::QueueId;
use mpi_match::transport::foreign::{ForeignInjector, ForeignQueue};
use mpi_match::transport::{Payload, PollMode, Transport, TransportKind};
use mpi_match::{ErrorKind, ANY_SOURCE, ANY_TAG};
use simple_logger::SimpleLogger;

fn setup() -> (Endpoint, Arc<ForeignQueue>, ForeignInjector) {
    let _ = SimpleLogger::new().with_level(log::LevelFilter::Warn).init();
    let (queue, injector) = ForeignQueue::new();
    let transport: Arc<dyn Transport> = queue.clone();
    let endpoint = Endpoint::builder(0).transport(transport).build().unwrap();
    (endpoint, queue, injector)
}

fn envelope(tag: i32, source: i32, id: u64, len: usize) -> Envelope {
    Envelope {
        key: MatchKey::new(0, tag, source),
        len,
        format: Format::native(),
        sender: SendHandle { origin: source, id },
    }
}

#[test]
fn foreign_queue_satisfies_posted_receive() {
    let (ep, queue, injector) = setup();
    let request = ep
        .immediate_receive_contig(MatchKey::new(0, ANY_TAG, 3), 8)
        .unwrap();
    assert_eq!(queue.posted_len(), 1);

    injector.deliver(envelope(5, 3, 1, 4), b"vndr".to_vec()).unwrap();
    let received = request.wait();
    assert_eq!(received.transport(), TransportKind::VendorMpi);
    assert_eq!(received.status().tag(), 5);
    assert_eq!(&received.bytes()[..4], b"vndr");

    // gone from both posted queues
    assert_eq!(ep.queue_len(QueueId::Posted), 0);
    assert_eq!(queue.posted_len(), 0);
}

#[test]
fn core_match_withdraws_the_mirror() {
    let (ep, queue, injector) = setup();
    let request = ep.immediate_receive_contig(MatchKey::new(0, 1, 3), 8).unwrap();
    ep.incoming(envelope(1, 3, 1, 4), Payload::Eager(b"core".to_vec()))
        .unwrap();
    assert_eq!(queue.posted_len(), 0);
    let received = request.wait();
    assert_eq!(received.transport(), TransportKind::Unknown);

    // a foreign message with nobody waiting stays with the foreign queue
    injector.deliver(envelope(1, 3, 2, 3), b"vnd".to_vec()).unwrap();
    ep.progress(PollMode::NonBlocking);
    assert_eq!(queue.arrived_len(), 1);
    assert_eq!(ep.queue_len(QueueId::Unexpected), 0);

    let received = ep.receive_contig(MatchKey::new(0, 1, 3), 8).unwrap();
    assert_eq!(received.transport(), TransportKind::VendorMpi);
    assert_eq!(&received.bytes()[..3], b"vnd");
    assert_eq!(queue.arrived_len(), 0);
}

#[test]
fn cancel_withdraws_the_mirror() {
    let (ep, queue, injector) = setup();
    let request = ep
        .immediate_receive_contig(MatchKey::new(0, 2, ANY_SOURCE), 8)
        .unwrap();
    request.cancel().unwrap();
    assert_eq!(queue.posted_len(), 0);
    assert_eq!(request.wait().status().error(), ErrorKind::Cancelled);

    injector.deliver(envelope(2, 4, 1, 0), Vec::new()).unwrap();
    ep.progress(PollMode::NonBlocking);
    assert_eq!(queue.arrived_len(), 1);
}

#[test]
fn foreign_queue_cannot_send() {
    let (ep, _queue, injector) = setup();
    assert_eq!(
        ep.immediate_send_bytes(1, 0, 0, vec![1]).unwrap_err().kind(),
        ErrorKind::Rank
    );
    let err = injector
        .deliver(envelope(ANY_TAG, 1, 1, 0), Vec::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Tag);
}

#[test]
fn racing_transports_deliver_each_message_once() {
    const PER_PATH: u64 = 100;
    let (ep, queue, injector) = setup();

    let mut seen = HashSet::new();
    let mut by_path = [0usize; 2];
    thread::scope(|scope| {
        scope.spawn(|| {
            for id in 0..PER_PATH {
                let data = format!("core{:03}", id).into_bytes();
                ep.incoming(envelope(7, 3, id, data.len()), Payload::Eager(data))
                    .unwrap();
            }
        });
        scope.spawn(|| {
            for id in 0..PER_PATH {
                let data = format!("vndr{:03}", id).into_bytes();
                injector
                    .deliver(envelope(7, 3, PER_PATH + id, data.len()), data)
                    .unwrap();
            }
        });
        for _ in 0..2 * PER_PATH {
            let received = ep
                .receive_contig(MatchKey::new(0, 7, ANY_SOURCE), 7)
                .unwrap();
            assert_eq!(received.status().error(), ErrorKind::Success);
            match received.transport() {
                TransportKind::VendorMpi => by_path[1] += 1,
                _ => by_path[0] += 1,
            }
            assert!(seen.insert(received.bytes().to_vec()));
        }
    });

    assert_eq!(seen.len(), 2 * PER_PATH as usize);
    assert_eq!(by_path, [PER_PATH as usize; 2]);
    assert_eq!(ep.queue_len(QueueId::Posted), 0);
    assert_eq!(ep.queue_len(QueueId::Unexpected), 0);
    assert_eq!(queue.posted_len(), 0);
    assert_eq!(queue.arrived_len(), 0);
}

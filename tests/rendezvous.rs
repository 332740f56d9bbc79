use std::thread;

use mpi_match::datatype::Format;
use mpi_match::endpoint::Endpoint;
use mpi_match::environment::{Config, Universe};
use mpi_match::queue::QueueId;
use mpi_match::traits::*;
use mpi_match::transport::mem::MemFabric;
use mpi_match::transport::{PollMode, TransportKind};
use mpi_match::ErrorKind;
use simple_logger::SimpleLogger;

const EAGER_LIMIT: usize = 16;

fn pair() -> (Universe, Endpoint, Endpoint) {
    let _ = SimpleLogger::new().with_level(log::LevelFilter::Warn).init();
    let fabric = MemFabric::new(&[Format::native(); 2]).with_eager_limit(EAGER_LIMIT);
    let universe = Universe::with_fabric(fabric, Config::default()).unwrap();
    let a = universe.endpoint(0).unwrap();
    let b = universe.endpoint(1).unwrap();
    (universe, a, b)
}

fn payload(len: usize) -> Vec<u32> {
    (0..len as u32).map(|i| i * 3 + 1).collect()
}

#[test]
fn large_message_is_pulled_after_match() {
    let (_universe, a, b) = pair();
    let data = payload(64);

    thread::scope(|scope| {
        scope.spawn(|| {
            let status = a.process_at_rank(1).send_with_tag(&data[..], 4).unwrap();
            assert!(!status.is_cancelled());
        });
        let mut buf = vec![0u32; 64];
        let status = b
            .process_at_rank(0)
            .receive_into_with_tag(&mut buf[..], 4)
            .unwrap();
        assert_eq!(status.error(), ErrorKind::Success);
        assert_eq!(status.byte_count(), 256);
        assert_eq!(buf, data);
    });
}

#[test]
fn unexpected_rendezvous_waits_for_a_receive() {
    let (_universe, a, b) = pair();
    let data = payload(32);
    let send = a
        .process_at_rank(1)
        .immediate_send_with_tag(&data[..], 9)
        .unwrap();

    // only the request to send has arrived
    b.progress(PollMode::NonBlocking);
    assert_eq!(b.queue_len(QueueId::Unexpected), 1);
    let probed = b.process_at_rank(0).probe_with_tag(9).unwrap();
    assert_eq!(probed.byte_count(), 128);
    let send = send.test().expect_err("nothing pulled yet");

    let request = b
        .process_at_rank(0)
        .immediate_receive_with_tag::<u32>(32, 9)
        .unwrap();
    thread::scope(|scope| {
        scope.spawn(|| assert!(!send.wait().is_cancelled()));
        let received = request.wait();
        assert_eq!(received.transport(), TransportKind::Device);
        let mut buf = vec![0u32; 32];
        received.copy_into(&mut buf[..]);
        assert_eq!(buf, data);
    });
}

#[test]
fn rendezvous_truncates_whole_elements() {
    let (_universe, a, b) = pair();
    let data = payload(10);
    let send = a
        .process_at_rank(1)
        .immediate_send_with_tag(&data[..], 1)
        .unwrap();
    let request = b
        .process_at_rank(0)
        .immediate_receive_with_tag::<u32>(6, 1)
        .unwrap();
    thread::scope(|scope| {
        scope.spawn(|| send.wait());
        let received = request.wait();
        assert_eq!(received.status().error(), ErrorKind::Truncate);
        assert_eq!(received.status().byte_count(), 24);
        let mut buf = [0u32; 6];
        received.copy_into(&mut buf[..]);
        assert_eq!(&buf[..], &data[..6]);
    });
}

#[test]
fn cancel_before_match_removes_the_request_to_send() {
    let (_universe, a, b) = pair();
    let data = payload(40);
    let send = a
        .process_at_rank(1)
        .immediate_send_with_tag(&data[..], 2)
        .unwrap();
    send.cancel().unwrap();
    b.progress(PollMode::NonBlocking);
    assert_eq!(b.queue_len(QueueId::Unexpected), 0);
    assert!(send.wait().is_cancelled());
    assert_eq!(a.outstanding_anti_sends(), 0);
}

#[test]
fn cancel_after_match_completes_normally() {
    let (_universe, a, b) = pair();
    let data = payload(40);
    let send = a
        .process_at_rank(1)
        .immediate_send_with_tag(&data[..], 2)
        .unwrap();
    let request = b
        .process_at_rank(0)
        .immediate_receive_with_tag::<u32>(40, 2)
        .unwrap();
    // matched, clear to send is on its way back
    b.progress(PollMode::NonBlocking);
    send.cancel().unwrap();
    // cancelling a matched receive does not stop the transfer either
    request.cancel().unwrap();

    thread::scope(|scope| {
        scope.spawn(|| assert!(!send.wait().is_cancelled()));
        let received = request.wait();
        assert_eq!(received.status().error(), ErrorKind::Success);
        let mut buf = vec![0u32; 40];
        received.copy_into(&mut buf[..]);
        assert_eq!(buf, data);
    });
}

#[test]
fn many_rendezvous_in_both_directions() {
    let (_universe, a, b) = pair();
    const ROUNDS: u32 = 20;

    thread::scope(|scope| {
        for (me, peer) in [(&a, 1), (&b, 0)] {
            scope.spawn(move || {
                let outgoing: Vec<_> = (0..ROUNDS)
                    .map(|round| {
                        let data = vec![round + me.rank() as u32 * 1000; 8];
                        me.process_at_rank(peer)
                            .immediate_send_with_tag(&data[..], round as i32)
                            .unwrap()
                    })
                    .collect();
                for round in 0..ROUNDS {
                    let (msg, status) = me
                        .process_at_rank(peer)
                        .receive_vec_with_tag::<u32>(round as i32)
                        .unwrap();
                    assert_eq!(status.error(), ErrorKind::Success);
                    assert_eq!(msg, vec![round + peer as u32 * 1000; 8]);
                }
                for send in outgoing {
                    assert!(!send.wait().is_cancelled());
                }
            });
        }
    });
}

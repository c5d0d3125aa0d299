//! Request/reply correlation over in-memory duplex channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchyard::{DuplexBinder, DuplexError};
use switchyard_core::mem::MemDuplexChannel;
use switchyard_core::{
    CommunicationState, Completer, Completion, DuplexChannel, Message, MessageId, Received,
    Scheduler, TransportError, INFINITE_TIMEOUT,
};
use switchyard_testkit::wait_until;

/// Answers every request after the delay in its `delay-ms` header.
fn delayed_peer(peer: Arc<MemDuplexChannel>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(Received::Item(request)) = peer.try_receive(INFINITE_TIMEOUT) {
            let Some(id) = request.message_id() else {
                continue;
            };
            let delay = request
                .header("delay-ms")
                .and_then(|ms| ms.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or_default();
            let peer = peer.clone();
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                let _ = peer.send(
                    Message::new("urn:reply").with_relates_to(id),
                    Duration::from_secs(1),
                );
            });
        }
    })
}

type SendCompleter = Completer<Result<(), TransportError>>;

/// A mem channel whose sends stay in flight until released.
struct HeldSends {
    inner: Arc<MemDuplexChannel>,
    held: Mutex<Vec<(Message, SendCompleter)>>,
}

impl HeldSends {
    fn new(inner: Arc<MemDuplexChannel>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            held: Mutex::new(Vec::new()),
        })
    }

    fn held(&self) -> usize {
        self.held.lock().len()
    }

    /// Put every held message on the wire and finish its send.
    fn release(&self) {
        let held = std::mem::take(&mut *self.held.lock());
        for (message, completer) in held {
            completer.complete(self.inner.send(message, Duration::from_secs(1)));
        }
    }
}

impl DuplexChannel for HeldSends {
    fn send(&self, message: Message, timeout: Duration) -> Result<(), TransportError> {
        self.inner.send(message, timeout)
    }

    fn begin_send(
        &self,
        message: Message,
        _timeout: Duration,
    ) -> Completion<Result<(), TransportError>> {
        let (completer, completion) = Completion::pending();
        self.held.lock().push((message, completer));
        completion
    }

    fn try_receive(&self, timeout: Duration) -> Result<Received<Message>, TransportError> {
        self.inner.try_receive(timeout)
    }

    fn session_id(&self) -> Option<u64> {
        self.inner.session_id()
    }

    fn state(&self) -> CommunicationState {
        self.inner.state()
    }

    fn close(&self, timeout: Duration) -> Result<(), TransportError> {
        self.inner.close(timeout)
    }

    fn abort(&self) {
        self.inner.abort();
    }
}

fn binder(local: Arc<dyn DuplexChannel>) -> (Arc<DuplexBinder>, Arc<Mutex<HashMap<MessageId, usize>>>) {
    let completions = Arc::new(Mutex::new(HashMap::new()));
    let sink = completions.clone();
    let binder = DuplexBinder::new(local, Scheduler::try_current().unwrap()).with_observer(
        move |id, _outcome| {
            *sink.lock().entry(id).or_insert(0) += 1;
        },
    );
    (Arc::new(binder), completions)
}

#[tokio::test(flavor = "multi_thread")]
async fn racing_replies_and_timeouts_complete_each_request_once() {
    switchyard_testkit::init_tracing();
    let (local, peer) = MemDuplexChannel::pair();
    let peer_thread = delayed_peer(peer);
    let (binder, completions) = binder(local.clone());
    let requests = Arc::new(AtomicUsize::new(0));
    let pump = {
        let binder = binder.clone();
        let requests = requests.clone();
        std::thread::spawn(move || {
            binder.pump(|_| {
                requests.fetch_add(1, Ordering::SeqCst);
            })
        })
    };

    // Replies land on both sides of the deadline.
    let mut handles = Vec::new();
    for i in 0..40u64 {
        let delay = (i * 7) % 30;
        let request = Message::new("urn:work").with_header("delay-ms", delay.to_string());
        handles.push(
            binder
                .send_request(request, Duration::from_millis(15))
                .unwrap(),
        );
    }
    let mut replied = 0;
    let mut timed_out = 0;
    for handle in handles {
        match handle.wait().await {
            Ok(reply) => {
                assert_eq!(reply.action(), Some("urn:reply"));
                replied += 1;
            }
            Err(DuplexError::Timeout(_)) => timed_out += 1,
            Err(other) => panic!("unexpected outcome: {other}"),
        }
    }
    assert_eq!(replied + timed_out, 40);

    // Every late reply is recognised and consumed.
    wait_until("late replies to drain", || binder.tombstone_count() == 0)
        .await
        .unwrap();
    assert_eq!(binder.pending_count(), 0);
    assert_eq!(binder.timed_out_count(), 0);
    assert_eq!(requests.load(Ordering::SeqCst), 0);
    {
        let completions = completions.lock();
        assert_eq!(completions.len(), 40);
        assert!(completions.values().all(|count| *count == 1));
    }

    local.close(Duration::from_secs(1)).unwrap();
    peer_thread.join().unwrap();
    local.abort();
    pump.join().unwrap().ok();
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_requests_reach_the_pump_callback() {
    let (local, peer) = MemDuplexChannel::pair();
    let (binder, _) = binder(local);
    let pump = {
        let binder = binder.clone();
        std::thread::spawn(move || {
            let mut seen = Vec::new();
            let result = binder.pump(|message| {
                seen.push(message.action().map(str::to_owned));
            });
            (result, seen)
        })
    };

    peer.send(Message::request("urn:callback"), Duration::from_secs(1))
        .unwrap();
    peer.send(
        Message::new("urn:reply").with_relates_to(MessageId::new_unique()),
        Duration::from_secs(1),
    )
    .unwrap();
    peer.close(Duration::from_secs(1)).unwrap();

    let (result, seen) = tokio::task::spawn_blocking(move || pump.join().unwrap())
        .await
        .unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(seen, vec![Some("urn:callback".to_owned())]);
}

#[tokio::test(flavor = "multi_thread")]
async fn end_of_stream_fails_pending_requests() {
    let (local, peer) = MemDuplexChannel::pair();
    let (binder, completions) = binder(local);
    let pump = {
        let binder = binder.clone();
        std::thread::spawn(move || binder.pump(|_| {}))
    };

    let handle = binder
        .send_request(Message::new("urn:work"), Duration::from_secs(30))
        .unwrap();
    peer.close(Duration::from_secs(1)).unwrap();

    assert_eq!(handle.wait().await.unwrap_err(), DuplexError::Closed);
    assert_eq!(binder.pending_count(), 0);
    assert_eq!(completions.lock().len(), 1);
    assert!(matches!(
        binder.send_request(Message::new("urn:work"), Duration::from_secs(1)),
        Err(DuplexError::Closed)
    ));
    tokio::task::spawn_blocking(move || pump.join().unwrap())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_send_completes_the_request() {
    let (local, _peer) = MemDuplexChannel::pair();
    local.close(Duration::from_secs(1)).unwrap();
    let (binder, completions) = binder(local);

    let handle = binder
        .send_request(Message::new("urn:work"), Duration::from_secs(30))
        .unwrap();
    assert!(matches!(
        handle.wait().await,
        Err(DuplexError::Send(_))
    ));
    assert_eq!(binder.pending_count(), 0);
    assert_eq!(binder.tombstone_count(), 0);
    assert_eq!(completions.lock().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unpumped_request_waits_inline_and_skips_strays() {
    let (local, peer) = MemDuplexChannel::pair();
    let (binder, _) = binder(local);
    let peer_thread = std::thread::spawn(move || {
        let Ok(Received::Item(request)) = peer.try_receive(INFINITE_TIMEOUT) else {
            panic!("peer saw no request");
        };
        let id = request.message_id().unwrap();
        let timeout = Duration::from_secs(1);
        peer.send(Message::request("urn:unsolicited"), timeout).unwrap();
        peer.send(
            Message::new("urn:reply").with_relates_to(MessageId::new_unique()),
            timeout,
        )
        .unwrap();
        peer.send(Message::new("urn:reply").with_relates_to(id), timeout)
            .unwrap();
        peer
    });

    let inline = binder.clone();
    let reply = tokio::task::spawn_blocking(move || {
        inline.request(Message::new("urn:work"), Duration::from_secs(5))
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.action(), Some("urn:reply"));
    assert_eq!(binder.pending_count(), 0);

    let peer = tokio::task::spawn_blocking(move || peer_thread.join().unwrap())
        .await
        .unwrap();
    drop(peer);
}

#[tokio::test(flavor = "multi_thread")]
async fn unpumped_request_times_out_and_remembers_the_id() {
    let (local, _peer) = MemDuplexChannel::pair();
    let (binder, _) = binder(local);
    let inline = binder.clone();
    let result = tokio::task::spawn_blocking(move || {
        inline.request(Message::new("urn:work"), Duration::from_millis(20))
    })
    .await
    .unwrap();
    assert_eq!(result.unwrap_err(), DuplexError::Timeout(Duration::from_millis(20)));
    assert_eq!(binder.tombstone_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_blocking_requests_are_both_answered() {
    let (local, peer) = MemDuplexChannel::pair();
    let peer_thread = delayed_peer(peer);
    let (binder, completions) = binder(local.clone());

    let first = {
        let binder = binder.clone();
        tokio::task::spawn_blocking(move || {
            let request = Message::new("urn:work").with_header("delay-ms", "200");
            binder.request(request, Duration::from_secs(2))
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The first caller is receiving; this one is answered after it leaves.
    let second = {
        let binder = binder.clone();
        tokio::task::spawn_blocking(move || {
            let request = Message::new("urn:work").with_header("delay-ms", "400");
            binder.request(request, Duration::from_secs(2))
        })
    };

    assert_eq!(first.await.unwrap().unwrap().action(), Some("urn:reply"));
    assert_eq!(second.await.unwrap().unwrap().action(), Some("urn:reply"));
    wait_until("receiving to stop", || !binder.is_receiving())
        .await
        .unwrap();
    assert_eq!(binder.pending_count(), 0);
    assert_eq!(binder.tombstone_count(), 0);
    assert_eq!(completions.lock().len(), 2);

    local.close(Duration::from_secs(1)).unwrap();
    tokio::task::spawn_blocking(move || peer_thread.join().unwrap())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_during_a_send_completes_once_the_send_finishes() {
    let (local, peer) = MemDuplexChannel::pair();
    let held = HeldSends::new(local);
    let (binder, completions) = binder(held.clone());

    let handle = binder
        .send_request(Message::new("urn:work"), Duration::from_millis(20))
        .unwrap();
    wait_until("request to time out", || binder.timed_out_count() == 1)
        .await
        .unwrap();
    // Still sending: the entry stays and nothing completes yet.
    assert_eq!(held.held(), 1);
    assert_eq!(binder.pending_count(), 1);
    assert_eq!(binder.tombstone_count(), 0);
    assert!(completions.lock().is_empty());

    held.release();
    assert_eq!(
        handle.wait().await.unwrap_err(),
        DuplexError::Timeout(Duration::from_millis(20))
    );
    assert_eq!(binder.timed_out_count(), 0);
    assert_eq!(binder.pending_count(), 0);
    assert_eq!(binder.tombstone_count(), 1);

    // The reply turns up after all and is swallowed by the tombstone.
    let Ok(Received::Item(request)) = peer.try_receive(Duration::from_secs(1)) else {
        panic!("request never reached the peer");
    };
    let reply = Message::new("urn:reply").with_relates_to(request.message_id().unwrap());
    assert!(binder.route_incoming(reply).is_none());
    assert_eq!(binder.tombstone_count(), 0);
    assert_eq!(completions.lock().values().copied().collect::<Vec<_>>(), vec![1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn reply_during_a_send_waits_for_the_send() {
    let (local, _peer) = MemDuplexChannel::pair();
    let held = HeldSends::new(local);
    let (binder, completions) = binder(held.clone());

    let handle = binder
        .send_request(Message::new("urn:work"), Duration::from_secs(5))
        .unwrap();
    let reply = Message::new("urn:reply").with_relates_to(handle.id());
    assert!(binder.route_incoming(reply).is_none());
    assert_eq!(binder.pending_count(), 0);
    assert!(completions.lock().is_empty());

    held.release();
    assert_eq!(handle.wait().await.unwrap().action(), Some("urn:reply"));
    assert_eq!(completions.lock().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reply_after_a_timeout_during_the_send_leaves_no_tombstone() {
    let (local, _peer) = MemDuplexChannel::pair();
    let held = HeldSends::new(local);
    let (binder, completions) = binder(held.clone());

    let handle = binder
        .send_request(Message::new("urn:work"), Duration::from_millis(20))
        .unwrap();
    wait_until("request to time out", || binder.timed_out_count() == 1)
        .await
        .unwrap();
    let reply = Message::new("urn:reply").with_relates_to(handle.id());
    assert!(binder.route_incoming(reply).is_none());
    assert_eq!(binder.pending_count(), 0);
    assert_eq!(binder.timed_out_count(), 0);
    assert!(completions.lock().is_empty());

    held.release();
    assert_eq!(
        handle.wait().await.unwrap_err(),
        DuplexError::Timeout(Duration::from_millis(20))
    );
    assert_eq!(binder.tombstone_count(), 0);
    assert_eq!(completions.lock().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_during_a_send_completes_the_request_once() {
    let (local, _peer) = MemDuplexChannel::pair();
    let held = HeldSends::new(local);
    let (binder, completions) = binder(held.clone());

    let handle = binder
        .send_request(Message::new("urn:work"), Duration::from_secs(5))
        .unwrap();
    binder.abort();
    assert_eq!(handle.wait().await.unwrap_err(), DuplexError::Aborted);

    // The send finishing afterwards changes nothing.
    held.release();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(binder.pending_count(), 0);
    assert_eq!(completions.lock().values().copied().collect::<Vec<_>>(), vec![1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_racing_replies_completes_each_request_once() {
    for round in 0..20u64 {
        let (local, peer) = MemDuplexChannel::pair();
        let peer_thread = delayed_peer(peer);
        let (binder, completions) = binder(local);
        let pump = {
            let binder = binder.clone();
            std::thread::spawn(move || binder.pump(|_| {}))
        };

        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let request =
                    Message::new("urn:work").with_header("delay-ms", ((i + round) % 4).to_string());
                binder.send_request(request, Duration::from_secs(5)).unwrap()
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(round % 4)).await;
        binder.abort();

        for handle in handles {
            match handle.wait().await {
                Ok(_) | Err(DuplexError::Aborted) => {}
                Err(other) => panic!("unexpected outcome: {other}"),
            }
        }
        assert_eq!(binder.pending_count(), 0);
        {
            let completions = completions.lock();
            assert_eq!(completions.len(), 8);
            assert!(completions.values().all(|count| *count == 1));
        }
        tokio::task::spawn_blocking(move || {
            pump.join().unwrap().ok();
            peer_thread.join().unwrap();
        })
        .await
        .unwrap();
    }
}

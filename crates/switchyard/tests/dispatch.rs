//! End-to-end dispatch over in-memory channels.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchyard::{
    ActionDemuxer, ChannelDispatcher, ConcurrencyMode, DispatchRuntime, Endpoint, EndpointTable,
    HeaderAuthenticator, InstanceContextMode, Operation, PumpMode, Stage,
};
use switchyard_core::mem::ReplyOutcome;
use switchyard_core::{
    DispatchError, DispatcherConfig, EndpointAddress, FaultCode, Message, Transaction,
    TransactionStatus,
};
use switchyard_filter::{ActionFilter, EndpointAddressFilter};
use switchyard_testkit::{
    echo_operation, expect_fault, expect_reply, outcome, scheduler, single_endpoint, wait_until,
    FailureScenario, RecordingReceiver, StageRecorder,
};

#[tokio::test(flavor = "multi_thread")]
async fn request_reply_sync_pump() {
    switchyard_testkit::init_tracing();
    switchyard_testkit::run_request_reply(PumpMode::Sync).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn request_reply_async_pump() {
    switchyard_testkit::init_tracing();
    switchyard_testkit::run_request_reply(PumpMode::Async).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_before_any_stage_finishes_the_request_once() {
    switchyard_testkit::init_tracing();
    for stage in Stage::ALL {
        switchyard_testkit::run_failure_at(stage, FailureScenario::Datagram).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_on_a_session_tears_the_channel_down_once() {
    switchyard_testkit::init_tracing();
    for stage in Stage::ALL {
        switchyard_testkit::run_failure_at(stage, FailureScenario::Session).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_after_a_suspended_invoke_finishes_the_request_once() {
    switchyard_testkit::init_tracing();
    for stage in Stage::ALL {
        switchyard_testkit::run_failure_at(stage, FailureScenario::Suspended).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn throttled_calls_park_and_resume_sync_pump() {
    switchyard_testkit::init_tracing();
    switchyard_testkit::run_throttle_parks_and_resumes(PumpMode::Sync).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn throttled_calls_park_and_resume_async_pump() {
    switchyard_testkit::init_tracing();
    switchyard_testkit::run_throttle_parks_and_resumes(PumpMode::Async).await;
}

fn echo_runtime(calls: Arc<AtomicUsize>) -> Arc<DispatchRuntime> {
    DispatchRuntime::builder(
        ActionDemuxer::new().with_operation(echo_operation("urn:echo", calls)),
        scheduler().unwrap(),
    )
    .instance_mode(InstanceContextMode::PerCall)
    .build()
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_call_runs_every_stage_in_order() {
    let recorder = StageRecorder::new();
    let runtime = DispatchRuntime::builder(
        ActionDemuxer::new().with_operation(echo_operation("urn:echo", Default::default())),
        scheduler().unwrap(),
    )
    .stage_hook(recorder.clone())
    .build();
    let dispatcher = ChannelDispatcher::new(
        single_endpoint(runtime),
        DispatcherConfig::default(),
        scheduler().unwrap(),
    );
    let (receiver, client) = RecordingReceiver::datagram();
    let handler = dispatcher.listen(receiver.clone());

    expect_reply(client.send(Message::request("urn:echo")).unwrap())
        .await
        .unwrap();
    client.close();
    wait_until("the pump to stop", || handler.is_stopped() && !handler.is_pumping())
        .await
        .unwrap();

    let calls = recorder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(recorder.stages(calls[0]), Stage::ALL.to_vec());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_action_gets_a_contract_fault() {
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = ChannelDispatcher::new(
        single_endpoint(echo_runtime(calls.clone())),
        DispatcherConfig::default(),
        scheduler().unwrap(),
    );
    let (receiver, client) = RecordingReceiver::datagram();
    let handler = dispatcher.listen(receiver.clone());

    let request = Message::request("urn:missing");
    let id = request.message_id();
    let fault = expect_fault(client.send(request).unwrap()).await.unwrap();
    assert_eq!(
        fault.fault().map(|f| f.code),
        Some(FaultCode::ContractFilterDidNotMatch)
    );
    assert_eq!(fault.relates_to(), id);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The channel survives a protocol fault.
    expect_reply(client.send(Message::request("urn:echo")).unwrap())
        .await
        .unwrap();

    client.close();
    wait_until("the pump to stop", || handler.is_stopped() && !handler.is_pumping())
        .await
        .unwrap();
    receiver.check_exactly_once().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn endpoint_filters_pick_the_endpoint_or_refuse() {
    let orders = Arc::new(AtomicUsize::new(0));
    let billing = Arc::new(AtomicUsize::new(0));
    let endpoints = EndpointTable::new()
        .with_endpoint(
            Endpoint::new("orders", echo_runtime(orders.clone()))
                .with_address_filter(EndpointAddressFilter::new("urn:orders"))
                .with_contract_filter(ActionFilter::new(["urn:echo"])),
        )
        .with_endpoint(
            Endpoint::new("billing", echo_runtime(billing.clone()))
                .with_address_filter(EndpointAddressFilter::new("urn:billing"))
                .with_contract_filter(ActionFilter::new(["urn:echo"])),
        );
    let dispatcher =
        ChannelDispatcher::new(endpoints, DispatcherConfig::default(), scheduler().unwrap());
    let (receiver, client) = RecordingReceiver::datagram();
    let handler = dispatcher.listen(receiver.clone());

    expect_reply(
        client
            .send(Message::request("urn:echo").with_to("urn:billing"))
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(billing.load(Ordering::SeqCst), 1);
    assert_eq!(orders.load(Ordering::SeqCst), 0);

    let fault = expect_fault(
        client
            .send(Message::request("urn:echo").with_to("urn:shipping"))
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(
        fault.fault().map(|f| f.code),
        Some(FaultCode::AddressFilterDidNotMatch)
    );

    let fault = expect_fault(
        client
            .send(Message::request("urn:refund").with_to("urn:orders"))
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(
        fault.fault().map(|f| f.code),
        Some(FaultCode::ContractFilterDidNotMatch)
    );

    // A none fault address means the refusal is silent.
    let silent = client
        .send(
            Message::request("urn:echo")
                .with_to("urn:shipping")
                .with_fault_to(EndpointAddress::None),
        )
        .unwrap();
    assert!(matches!(outcome(silent).await.unwrap(), ReplyOutcome::Closed));

    client.close();
    wait_until("the pump to stop", || handler.is_stopped() && !handler.is_pumping())
        .await
        .unwrap();
    receiver.check_exactly_once().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_message_id_is_a_header_fault() {
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = ChannelDispatcher::new(
        single_endpoint(echo_runtime(calls.clone())),
        DispatcherConfig::default(),
        scheduler().unwrap(),
    );
    let (receiver, client) = RecordingReceiver::datagram();
    let handler = dispatcher.listen(receiver.clone());

    let fault = expect_fault(client.send(Message::new("urn:echo")).unwrap())
        .await
        .unwrap();
    assert_eq!(
        fault.fault().map(|f| f.code),
        Some(FaultCode::MessageHeaderError)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    client.close();
    wait_until("the pump to stop", || handler.is_stopped() && !handler.is_pumping())
        .await
        .unwrap();
    receiver.check_exactly_once().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn authentication_refuses_unknown_callers() {
    let runtime = DispatchRuntime::builder(
        ActionDemuxer::new().with_operation(echo_operation("urn:echo", Default::default())),
        scheduler().unwrap(),
    )
    .authenticator(HeaderAuthenticator::new("token", ["secret"]))
    .build();
    let dispatcher = ChannelDispatcher::new(
        single_endpoint(runtime),
        DispatcherConfig::default(),
        scheduler().unwrap(),
    );
    let (receiver, client) = RecordingReceiver::datagram();
    let handler = dispatcher.listen(receiver.clone());

    let fault = expect_fault(client.send(Message::request("urn:echo")).unwrap())
        .await
        .unwrap();
    assert_eq!(fault.fault().map(|f| f.code), Some(FaultCode::AccessDenied));
    expect_reply(
        client
            .send(Message::request("urn:echo").with_header("token", "secret"))
            .unwrap(),
    )
    .await
    .unwrap();

    client.close();
    wait_until("the pump to stop", || handler.is_stopped() && !handler.is_pumping())
        .await
        .unwrap();
    receiver.check_exactly_once().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn async_and_one_way_operations() {
    let one_way_calls = Arc::new(AtomicUsize::new(0));
    let counter = one_way_calls.clone();
    let demuxer = ActionDemuxer::new()
        .with_operation(Operation::future("slow", "urn:slow", |_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Some(Message::new("unused")))
        }))
        .with_operation(
            Operation::sync("notify", "urn:notify", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Message::new("dropped")))
            })
            .one_way(),
        );
    let runtime = DispatchRuntime::builder(demuxer, scheduler().unwrap())
        .instance_mode(InstanceContextMode::PerCall)
        .build();
    let dispatcher = ChannelDispatcher::new(
        single_endpoint(runtime),
        DispatcherConfig::default(),
        scheduler().unwrap(),
    )
    .with_pump_mode(PumpMode::Async);
    let (receiver, client) = RecordingReceiver::datagram();
    let handler = dispatcher.listen(receiver.clone());

    let reply = expect_reply(client.send(Message::request("urn:slow")).unwrap())
        .await
        .unwrap();
    assert_eq!(reply.action(), Some("urn:slowResponse"));

    let notified = client.send(Message::new("urn:notify")).unwrap();
    assert!(matches!(
        outcome(notified).await.unwrap(),
        ReplyOutcome::Closed
    ));
    assert_eq!(one_way_calls.load(Ordering::SeqCst), 1);

    client.close();
    wait_until("the pump to stop", || handler.is_stopped() && !handler.is_pumping())
        .await
        .unwrap();
    receiver.check_exactly_once().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn terminating_operation_ends_the_session() {
    let demuxer = ActionDemuxer::new()
        .with_operation(echo_operation("urn:echo", Default::default()))
        .with_operation(
            Operation::sync("bye", "urn:bye", |_| Ok(Some(Message::new("unused")))).terminating(),
        );
    let runtime = DispatchRuntime::builder(demuxer, scheduler().unwrap()).build();
    let dispatcher = ChannelDispatcher::new(
        single_endpoint(runtime),
        DispatcherConfig::default(),
        scheduler().unwrap(),
    );
    let (receiver, client) = RecordingReceiver::session();
    let handler = dispatcher.listen(receiver.clone());

    expect_reply(client.send(Message::request("urn:echo")).unwrap())
        .await
        .unwrap();
    expect_reply(client.send(Message::request("urn:bye")).unwrap())
        .await
        .unwrap();
    let channel = handler.session_channel().unwrap();
    wait_until("the session to be terminated", || channel.is_terminated())
        .await
        .unwrap();

    let fault = expect_fault(client.send(Message::request("urn:echo")).unwrap())
        .await
        .unwrap();
    assert_eq!(
        fault.fault().map(|f| f.code),
        Some(FaultCode::SessionTerminated)
    );

    client.close();
    wait_until("the session to end", || {
        handler.is_stopped() && !handler.is_pumping() && dispatcher.throttle().active_sessions() == 0
    })
    .await
    .unwrap();
    receiver.check_exactly_once().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_session_is_torn_down() {
    let config = DispatcherConfig {
        session_idle_timeout: Some(Duration::from_millis(50)),
        ..DispatcherConfig::default()
    };
    let dispatcher = ChannelDispatcher::new(
        single_endpoint(echo_runtime(Default::default())),
        config,
        scheduler().unwrap(),
    );
    let (receiver, _client) = RecordingReceiver::session();
    let handler = dispatcher.listen(receiver.clone());

    wait_until("the idle session to stop", || {
        handler.is_stopped() && !handler.is_pumping() && dispatcher.throttle().active_sessions() == 0
    })
    .await
    .unwrap();
    assert_eq!(receiver.received(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn reentrant_instance_admits_a_callback_while_the_call_is_out() {
    let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
    let entered_rx = Mutex::new(entered_rx);
    let demuxer = ActionDemuxer::new()
        .with_operation(Operation::sync("outer", "urn:outer", move |call| {
            let reentered = call.call_out(|| {
                entered_rx
                    .lock()
                    .recv_timeout(Duration::from_secs(5))
                    .is_ok()
            })?;
            Ok(Some(
                Message::new("unused").with_header("reentered", reentered.to_string()),
            ))
        }))
        .with_operation(Operation::sync("callback", "urn:callback", move |_| {
            let _ = entered_tx.send(());
            Ok(Some(Message::new("unused")))
        }));
    let runtime = DispatchRuntime::builder(demuxer, scheduler().unwrap())
        .instance_mode(InstanceContextMode::Single)
        .concurrency_mode(ConcurrencyMode::Reentrant)
        .build();
    let dispatcher = ChannelDispatcher::new(
        single_endpoint(runtime.clone()),
        DispatcherConfig::default(),
        scheduler().unwrap(),
    );
    let (receiver, client) = RecordingReceiver::datagram();
    let handler = dispatcher.listen(receiver.clone());

    let outer = client.send(Message::request("urn:outer")).unwrap();
    let callback = client.send(Message::request("urn:callback")).unwrap();
    expect_reply(callback).await.unwrap();
    let reply = expect_reply(outer).await.unwrap();
    assert_eq!(reply.header("reentered"), Some("true"));

    let instance = runtime.singleton().unwrap();
    assert!(!instance.is_locked());
    let stats = instance.lock_stats();
    assert_eq!(stats.locks, stats.unlocks);

    client.close();
    wait_until("the pump to stop", || handler.is_stopped() && !handler.is_pumping())
        .await
        .unwrap();
    receiver.check_exactly_once().unwrap();
}

fn batched_dispatcher(seen: Arc<Mutex<Vec<Transaction>>>) -> ChannelDispatcher {
    let runtime = DispatchRuntime::builder(
        ActionDemuxer::new().with_operation(Operation::sync("work", "urn:work", move |call| {
            if let Some(transaction) = call.transaction() {
                seen.lock().push(transaction.clone());
            }
            if call.message.header("fail").is_some() {
                return Err(DispatchError::handler("work failed"));
            }
            Ok(Some(Message::new("unused")))
        })),
        scheduler().unwrap(),
    )
    .instance_mode(InstanceContextMode::PerCall)
    .build();
    let config = DispatcherConfig {
        max_batch_size: 2,
        ..DispatcherConfig::default()
    };
    ChannelDispatcher::new(single_endpoint(runtime), config, scheduler().unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn batched_calls_share_one_committed_transaction() {
    batched_calls_commit_together(PumpMode::Sync).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn batched_calls_share_one_committed_transaction_async_pump() {
    batched_calls_commit_together(PumpMode::Async).await;
}

async fn batched_calls_commit_together(mode: PumpMode) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = batched_dispatcher(seen.clone()).with_pump_mode(mode);
    let (receiver, client) = RecordingReceiver::datagram();
    let handler = dispatcher.listen(receiver.clone());

    for _ in 0..2 {
        expect_reply(client.send(Message::request("urn:work")).unwrap())
            .await
            .unwrap();
    }
    let (first, second) = {
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        (seen[0].clone(), seen[1].clone())
    };
    assert!(first.ptr_eq(&second));
    wait_until("the batch to commit", || {
        first.status() == TransactionStatus::Committed
    })
    .await
    .unwrap();

    client.close();
    wait_until("the pump to stop", || handler.is_stopped() && !handler.is_pumping())
        .await
        .unwrap();
    receiver.check_exactly_once().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn one_failed_call_rolls_back_its_batch() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = batched_dispatcher(seen.clone());
    let (receiver, client) = RecordingReceiver::datagram();
    let handler = dispatcher.listen(receiver.clone());

    expect_reply(client.send(Message::request("urn:work")).unwrap())
        .await
        .unwrap();
    expect_fault(
        client
            .send(Message::request("urn:work").with_header("fail", "1"))
            .unwrap(),
    )
    .await
    .unwrap();
    let transaction = seen.lock()[0].clone();
    wait_until("the batch to roll back", || {
        transaction.status() == TransactionStatus::Aborted
    })
    .await
    .unwrap();

    client.close();
    wait_until("the pump to stop", || handler.is_stopped() && !handler.is_pumping())
        .await
        .unwrap();
    receiver.check_exactly_once().unwrap();
}

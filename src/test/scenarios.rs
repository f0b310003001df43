//! End-to-end scenarios against in-process mock nodes.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use pretty_assertions::assert_eq;
use tokio::sync::{mpsc, oneshot};

use super::{
    mock_node::{Behavior, MockNode, MockReply},
    test_credentials, test_options, TEST_AUTH_NAME,
};
use crate::{
    addr::NodeAddr,
    client::Client,
    conn::{Connection, ConnectionStatus, RegisterOutcome},
    credentials::CredentialStore,
    error::{AbortReason, ErrorKind, UnsupportedKind},
    notifier::Notification,
    options::{ClientOptions, ConnectionOptions},
    proto::StatusCode,
    request::{
        registry::RequestRegistry,
        suspendable::{
            DesiredState, MessageClass, SharedWorking, StreamController, StreamState,
            SuspendableRequest,
        },
        AllNodesHandler, EventDispatcher, EventDispatcherAllNodes, EventDispatcherRoundRobin,
        FinishedNotifier, RequestContext, RequestFinished, RequestType, RoundRobinHandler,
        SingleNodeHandler,
    },
    stats::RequestStats,
};

const OP_PUT: u8 = 1;

const MSG_INIT: u8 = 10;
const MSG_CONTROL: u8 = 11;
const MSG_ACK: u8 = 12;
const MSG_DATA: u8 = 13;
const MSG_EXIT: u8 = 14;

fn ok_behavior() -> Behavior {
    Arc::new(|_id, _payload| vec![MockReply::Payload(vec![StatusCode::Ok as u8])])
}

fn silent_behavior() -> Behavior {
    Arc::new(|_id, _payload| vec![MockReply::Silence])
}

fn capture_finished() -> (FinishedNotifier, oneshot::Receiver<RequestFinished>) {
    let (sender, receiver) = oneshot::channel();
    (
        Box::new(move |finished| {
            let _ = sender.send(finished);
        }),
        receiver,
    )
}

fn put_handler(key: u64, value: Vec<u8>) -> SingleNodeHandler {
    Box::new(move |mut dispatcher: EventDispatcher, _context: RequestContext| {
        Box::pin(async move {
            dispatcher
                .send(move || {
                    let mut payload = vec![OP_PUT];
                    payload.extend_from_slice(&key.to_le_bytes());
                    payload.extend_from_slice(&value);
                    payload
                })
                .await?;
            let reply = dispatcher.receive().await?;
            let address = dispatcher.address().expect("single-node handler is bound");
            match StatusCode::from_u8(*reply.first().unwrap_or(&u8::MAX))? {
                StatusCode::Ok => Ok(()),
                StatusCode::Error => Err(ErrorKind::Node { address }.into()),
                StatusCode::RequestNotSupported => Err(ErrorKind::Unsupported {
                    address,
                    kind: UnsupportedKind::Request,
                }
                .into()),
                StatusCode::VersionNotSupported => Err(ErrorKind::Unsupported {
                    address,
                    kind: UnsupportedKind::Version,
                }
                .into()),
            }
        })
    })
}

fn receive_forever_handler() -> SingleNodeHandler {
    Box::new(|mut dispatcher: EventDispatcher, _context: RequestContext| {
        Box::pin(async move {
            dispatcher.receive().await?;
            Ok(())
        })
    })
}

fn test_client(nodes: &[NodeAddr]) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let client = Client::new(test_options(sender));
    for address in nodes {
        assert!(client.add_node(*address));
    }
    (client, receiver)
}

async fn wait_connected(client: &Client, address: &NodeAddr) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if client.node_status(address) == Some(ConnectionStatus::Connected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection did not come up in time")
}

async fn finished_within(
    receiver: oneshot::Receiver<RequestFinished>,
    timeout: Duration,
) -> RequestFinished {
    tokio::time::timeout(timeout, receiver)
        .await
        .expect("request did not finish in time")
        .expect("finished notifier dropped without firing")
}

#[tokio::test]
async fn put_request_succeeds() {
    let node = MockNode::spawn(ok_behavior()).await;
    let (client, _notifications) = test_client(&[node.address()]);
    wait_connected(&client, &node.address()).await;

    let (notifier, finished) = capture_finished();
    let id = client
        .requests()
        .start_single_node(
            node.address(),
            vec![],
            put_handler(0x1234_5678_9abc_def0, vec![0xaa, 0xbb]),
            notifier,
        )
        .unwrap();
    assert_eq!(id, 1);

    let finished = finished_within(finished, Duration::from_secs(10)).await;
    assert_eq!(finished.request_id, 1);
    assert!(finished.outcome.is_success());
    assert_eq!(client.requests().num_active(), 0);

    let stats = client.requests().stats();
    assert_eq!(stats.for_type(RequestType::SingleNode).succeeded, 1);
    client.shutdown().await;
}

#[tokio::test]
async fn node_error_is_reported() {
    let node = MockNode::spawn(Arc::new(|_id, _payload| {
        vec![MockReply::Payload(vec![StatusCode::Error as u8])]
    }))
    .await;
    let (client, _notifications) = test_client(&[node.address()]);
    wait_connected(&client, &node.address()).await;

    let (notifier, finished) = capture_finished();
    client
        .requests()
        .start_single_node(node.address(), vec![], put_handler(1, vec![0x01]), notifier)
        .unwrap();

    let finished = finished_within(finished, Duration::from_secs(10)).await;
    let error = finished.outcome.error().expect("node error must surface");
    assert!(matches!(
        error.kind.as_ref(),
        ErrorKind::Node { address } if *address == node.address()
    ));
    assert_eq!(client.requests().num_active(), 0);
    client.shutdown().await;
}

#[tokio::test]
async fn request_timeout_aborts() {
    let node = MockNode::spawn(silent_behavior()).await;
    let (client, _notifications) = test_client(&[node.address()]);
    wait_connected(&client, &node.address()).await;

    let (notifier, finished) = capture_finished();
    let id = client
        .requests()
        .start_single_node(node.address(), vec![], put_handler(2, vec![0x02]), notifier)
        .unwrap();
    assert!(client
        .requests()
        .set_request_timeout(id, Duration::from_millis(50)));

    let finished = finished_within(finished, Duration::from_secs(10)).await;
    let error = finished.outcome.error().expect("timeout must surface");
    assert_eq!(error.abort_reason(), Some(AbortReason::Timeout));
    assert_eq!(client.requests().num_active(), 0);

    let stats = client.requests().stats();
    assert_eq!(stats.for_type(RequestType::SingleNode).timed_out, 1);
    client.shutdown().await;
}

#[tokio::test]
async fn corrupted_header_drops_the_connection_and_reconnects() {
    let corrupted_once = Arc::new(AtomicBool::new(false));
    let behavior: Behavior = {
        let corrupted_once = corrupted_once.clone();
        Arc::new(move |id, _payload| {
            if !corrupted_once.swap(true, Ordering::SeqCst) {
                // A frame whose parity byte has one bit flipped.
                let message = crate::proto::Message::request(id, &[0x00]);
                let mut raw = message.header.to_bytes().to_vec();
                raw[9] ^= 0x01;
                raw.extend_from_slice(&message.body);
                vec![MockReply::RawBytes(raw), MockReply::Close]
            } else {
                vec![MockReply::Payload(vec![StatusCode::Ok as u8])]
            }
        })
    };
    let node = MockNode::spawn(behavior).await;
    let (client, mut notifications) = test_client(&[node.address()]);
    wait_connected(&client, &node.address()).await;

    let (notifier, finished) = capture_finished();
    client
        .requests()
        .start_single_node(node.address(), vec![], put_handler(3, vec![0x03]), notifier)
        .unwrap();

    // The in-flight request fails with a disconnect, not a hang.
    let finished = finished_within(finished, Duration::from_secs(10)).await;
    let error = finished.outcome.error().expect("disconnect must surface");
    assert!(error.is_network_error(), "unexpected error: {}", error);

    // The client notices the drop and comes back up with a fresh session.
    let saw = tokio::time::timeout(Duration::from_secs(10), async {
        let (mut dropped, mut reconnected) = (false, false);
        while let Some(notification) = notifications.recv().await {
            match notification {
                Notification::Disconnected { .. } => dropped = true,
                Notification::Connected { .. } if dropped => {
                    reconnected = true;
                    break;
                }
                _ => {}
            }
        }
        (dropped, reconnected)
    })
    .await
    .expect("reconnect notifications did not arrive");
    assert_eq!(saw, (true, true));

    // And the fresh session serves requests again.
    let (notifier, finished) = capture_finished();
    client
        .requests()
        .start_single_node(node.address(), vec![], put_handler(4, vec![0x04]), notifier)
        .unwrap();
    let finished = finished_within(finished, Duration::from_secs(10)).await;
    assert!(finished.outcome.is_success());
    client.shutdown().await;
}

#[tokio::test]
async fn connect_retries_until_the_node_appears() {
    // Learn a free port, then leave it unbound so the first attempts are refused.
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = placeholder.local_addr().unwrap().port();
    drop(placeholder);
    let address = NodeAddr::parse("127.0.0.1", port).unwrap();

    let (client, mut notifications) = test_client(&[address]);
    assert_eq!(client.num_initializing(), 1);

    // Collect a couple of failed attempts.
    let mut failures = 0;
    while failures < 2 {
        match tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .expect("expected connect failures")
        {
            Some(Notification::ErrorWhileConnecting { .. }) => failures += 1,
            Some(other) => panic!("unexpected notification {:?}", other),
            None => panic!("notification channel closed"),
        }
    }

    // Bring the node up on that port; the retry loop finds it without intervention.
    let _node = MockNode::spawn_on(port, ok_behavior()).await;
    wait_connected(&client, &address).await;
    assert_eq!(client.num_initializing(), 0);
    client.shutdown().await;
}

fn classify(message: &[u8]) -> MessageClass {
    match message.first() {
        Some(&MSG_ACK) => MessageClass::Ack,
        Some(&MSG_DATA) => MessageClass::Continue,
        Some(&MSG_EXIT) => MessageClass::Exit,
        _ => MessageClass::Undefined,
    }
}

fn desired_byte(state: DesiredState) -> u8 {
    match state {
        DesiredState::None => 0,
        DesiredState::Running => 1,
        DesiredState::Suspended => 2,
        DesiredState::Stopped => 3,
    }
}

fn streaming_handler(
    shared: Arc<SharedWorking>,
    events: mpsc::UnboundedSender<&'static str>,
) -> AllNodesHandler {
    Arc::new(move |mut dispatcher: EventDispatcherAllNodes, _context: RequestContext| {
        let shared = shared.clone();
        let events = events.clone();
        Box::pin(async move {
            let mut stream = SuspendableRequest::new(&mut dispatcher, shared);
            let mut state = StreamState::EstablishingConnection;
            loop {
                state = match state {
                    StreamState::EstablishingConnection => stream.establish_connection().await?,
                    StreamState::Initialising => {
                        let events = events.clone();
                        stream
                            .initialise(
                                || vec![MSG_INIT],
                                |status| assert!(status.is_ok()),
                                move || {
                                    let _ = events.send("first_init");
                                },
                            )
                            .await?
                    }
                    StreamState::Receiving => stream.receive(classify).await?,
                    StreamState::RequestingStateChange => {
                        let events = events.clone();
                        stream
                            .request_state_change(
                                |desired| vec![MSG_CONTROL, desired_byte(desired)],
                                classify,
                                move || {
                                    let _ = events.send("state_changed");
                                },
                            )
                            .await?
                    }
                    StreamState::Exit => break,
                };
            }
            Ok(())
        })
    })
}

fn streaming_behavior() -> Behavior {
    Arc::new(|_id, payload| match payload.first() {
        Some(&MSG_INIT) => vec![MockReply::Payload(vec![StatusCode::Ok as u8])],
        Some(&MSG_CONTROL) => vec![MockReply::Payload(vec![MSG_ACK])],
        _ => vec![MockReply::Silence],
    })
}

#[tokio::test]
async fn suspendable_stream_suspends_and_stops_across_all_nodes() {
    let nodes = [
        MockNode::spawn(streaming_behavior()).await,
        MockNode::spawn(streaming_behavior()).await,
        MockNode::spawn(streaming_behavior()).await,
    ];
    let addresses: Vec<NodeAddr> = nodes.iter().map(MockNode::address).collect();
    let (client, _notifications) = test_client(&addresses);
    for address in &addresses {
        wait_connected(&client, address).await;
    }

    let shared = SharedWorking::new();
    let (events, mut event_rx) = mpsc::unbounded_channel();
    let (notifier, finished) = capture_finished();
    let id = client
        .requests()
        .start_all_nodes(
            vec![],
            streaming_handler(shared.clone(), events),
            notifier,
        )
        .unwrap();

    // Initialisation completes on all three nodes; the one-shot callback fires once.
    let event = tokio::time::timeout(Duration::from_secs(10), event_rx.recv())
        .await
        .unwrap();
    assert_eq!(event, Some("first_init"));
    assert_eq!(shared.initialised(), 3);

    // Suspend: admissible, and acknowledged by every node before state_changed fires.
    let controller = client
        .requests()
        .get_request_controller(id, RequestType::AllNodes)
        .unwrap();
    let stream_controller = StreamController::new(controller, shared.clone());
    assert!(stream_controller.suspend(|| {}));
    let event = tokio::time::timeout(Duration::from_secs(10), event_rx.recv())
        .await
        .unwrap();
    assert_eq!(event, Some("state_changed"));
    assert_eq!(shared.waiting_for_ack(), 0);
    assert_eq!(shared.desired_state(), DesiredState::Suspended);

    // Stop: the handlers signal the nodes and exit; the request finishes exactly once.
    assert!(stream_controller.stop(|| {}));
    let event = tokio::time::timeout(Duration::from_secs(10), event_rx.recv())
        .await
        .unwrap();
    assert_eq!(event, Some("state_changed"));

    let finished = finished_within(finished, Duration::from_secs(10)).await;
    assert!(finished.outcome.is_success());
    assert_eq!(client.requests().num_active(), 0);
    client.shutdown().await;
}

#[tokio::test]
async fn request_ids_are_unique_and_capacity_is_bounded() {
    let node = MockNode::spawn(silent_behavior()).await;
    let (sender, _receiver) = mpsc::unbounded_channel();
    let options = ClientOptions::builder()
        .credentials(test_credentials())
        .rng_seed(7)
        .max_requests(2)
        .notifier(Arc::new(move |notification| {
            let _ = sender.send(notification);
        }))
        .build();
    let client = Client::new(options);
    client.add_node(node.address());
    wait_connected(&client, &node.address()).await;

    let (notifier_a, finished_a) = capture_finished();
    let (notifier_b, finished_b) = capture_finished();
    let first = client
        .requests()
        .start_single_node(node.address(), vec![], receive_forever_handler(), notifier_a)
        .unwrap();
    let second = client
        .requests()
        .start_single_node(node.address(), vec![], receive_forever_handler(), notifier_b)
        .unwrap();
    assert_eq!((first, second), (1, 2));

    // The pool is full: the next start fails synchronously.
    let (notifier_c, _finished_c) = capture_finished();
    let error = client
        .requests()
        .start_single_node(node.address(), vec![], receive_forever_handler(), notifier_c)
        .unwrap_err();
    assert!(error.is_pool_exhausted());

    // Draining the pool makes room again.
    assert!(client.requests().abort_request(first, AbortReason::User).unwrap());
    assert!(client.requests().abort_request(second, AbortReason::User).unwrap());
    let both = tokio::time::timeout(
        Duration::from_secs(10),
        futures::future::join(finished_a, finished_b),
    )
    .await
    .expect("aborted requests did not finish in time");
    for finished in [both.0.unwrap(), both.1.unwrap()] {
        assert_eq!(
            finished.outcome.error().and_then(|e| e.abort_reason()),
            Some(AbortReason::User)
        );
    }
    assert_eq!(client.requests().num_active(), 0);

    let (notifier_d, _finished_d) = capture_finished();
    let third = client
        .requests()
        .start_single_node(node.address(), vec![], receive_forever_handler(), notifier_d)
        .unwrap();
    assert_eq!(third, 3);
    client.shutdown().await;
}

#[tokio::test]
async fn abort_from_the_requests_own_handler_is_rejected() {
    let node = MockNode::spawn(ok_behavior()).await;
    let (client, _notifications) = test_client(&[node.address()]);
    wait_connected(&client, &node.address()).await;

    let requests = client.requests().clone();
    let handler: SingleNodeHandler =
        Box::new(move |_dispatcher: EventDispatcher, context: RequestContext| {
            Box::pin(async move {
                let error = requests
                    .abort_request(context.request_id(), AbortReason::User)
                    .unwrap_err();
                assert!(matches!(
                    error.kind.as_ref(),
                    ErrorKind::InvalidArgument { .. }
                ));
                Ok(())
            })
        });
    let (notifier, finished) = capture_finished();
    client
        .requests()
        .start_single_node(node.address(), vec![], handler, notifier)
        .unwrap();
    let finished = finished_within(finished, Duration::from_secs(10)).await;
    assert!(finished.outcome.is_success());
    client.shutdown().await;
}

#[tokio::test]
async fn controller_sees_context_and_working_data() {
    let node = MockNode::spawn(silent_behavior()).await;
    let (client, _notifications) = test_client(&[node.address()]);
    wait_connected(&client, &node.address()).await;

    let (ready, mut ready_rx) = mpsc::unbounded_channel();
    let handler: SingleNodeHandler =
        Box::new(move |mut dispatcher: EventDispatcher, _context: RequestContext| {
            Box::pin(async move {
                dispatcher.with_working_data(|data| data.extend_from_slice(b"progress"));
                let _ = ready.send(());
                dispatcher.receive().await?;
                Ok(())
            })
        });
    let (notifier, finished) = capture_finished();
    let id = client
        .requests()
        .start_single_node(node.address(), vec![7, 8, 9], handler, notifier)
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), ready_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let controller = client
        .requests()
        .get_request_controller(id, RequestType::SingleNode)
        .unwrap();
    assert_eq!(
        controller.context_blob(|bytes| bytes.to_vec()),
        Some(vec![7, 8, 9])
    );
    let mut seen = Vec::new();
    assert!(controller.access_request_working_data(|_index, data| seen.push(data.clone())));
    assert_eq!(seen, vec![b"progress".to_vec()]);

    // Wrong type guess gets no controller.
    assert!(client
        .requests()
        .get_request_controller(id, RequestType::AllNodes)
        .is_none());

    client
        .requests()
        .abort_request(id, AbortReason::User)
        .unwrap();
    let finished = finished_within(finished, Duration::from_secs(10)).await;
    assert_eq!(finished.context, vec![7, 8, 9]);
    client.shutdown().await;
}

#[tokio::test]
async fn reconnect_registration_is_idempotent() {
    // Nothing listens on this port, so the connection sits in its retry loop.
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = placeholder.local_addr().unwrap().port();
    drop(placeholder);
    let address = NodeAddr::parse("127.0.0.1", port).unwrap();

    let registry = RequestRegistry::new(16, Arc::new(RequestStats::new()));
    let credentials = Arc::new(CredentialStore::new(test_credentials()));
    let conn = Connection::start(
        address,
        registry,
        credentials,
        ConnectionOptions {
            connect_timeout: Some(Duration::from_millis(100)),
            auth_name: TEST_AUTH_NAME.to_string(),
        },
        Box::new(|_, _| {}),
        Box::new(|_, _| {}),
    );

    assert_eq!(
        conn.register_for_connected_notification(9).await,
        RegisterOutcome::Registered
    );
    assert_eq!(
        conn.register_for_connected_notification(9).await,
        RegisterOutcome::AlreadyRegistered
    );
    // Unregistering twice is fine.
    conn.unregister_for_connected_notification(9);
    conn.unregister_for_connected_notification(9);
    assert_eq!(
        conn.register_for_connected_notification(9).await,
        RegisterOutcome::Registered
    );
    conn.shutdown_and_halt().await;
    assert_eq!(
        conn.register_for_connected_notification(9).await,
        RegisterOutcome::ShutDown
    );
}

#[tokio::test]
async fn round_robin_request_uses_a_connected_node() {
    let node_a = MockNode::spawn(ok_behavior()).await;
    let node_b = MockNode::spawn(ok_behavior()).await;
    let (client, _notifications) = test_client(&[node_a.address(), node_b.address()]);
    wait_connected(&client, &node_a.address()).await;
    wait_connected(&client, &node_b.address()).await;

    let handler: RoundRobinHandler = Box::new(
        move |mut dispatcher: EventDispatcherRoundRobin, context: RequestContext| {
            Box::pin(async move {
                loop {
                    let Some(mut scope) = dispatcher.next_node()? else {
                        return Err(crate::error::Error::internal("no node served the request"));
                    };
                    scope.send(|| vec![OP_PUT]).await?;
                    let reply = scope.receive().await?;
                    if StatusCode::from_u8(*reply.first().unwrap_or(&u8::MAX))?.is_ok() {
                        let address = scope.address().expect("scope is bound");
                        context.with(|bytes| {
                            bytes.extend_from_slice(&address.cmp_id().to_le_bytes())
                        });
                        return Ok(());
                    }
                }
            })
        },
    );
    let (notifier, finished) = capture_finished();
    client
        .requests()
        .start_round_robin(vec![], handler, notifier)
        .unwrap();

    let finished = finished_within(finished, Duration::from_secs(10)).await;
    assert!(finished.outcome.is_success());
    let served_by = u64::from_le_bytes(finished.context.as_slice().try_into().unwrap());
    assert!(
        served_by == node_a.address().cmp_id() || served_by == node_b.address().cmp_id(),
        "served by an unknown node: {}",
        served_by
    );
    client.shutdown().await;
}

#[tokio::test]
async fn multi_node_request_spreads_over_chosen_nodes() {
    let node_a = MockNode::spawn(ok_behavior()).await;
    let node_b = MockNode::spawn(ok_behavior()).await;
    let (client, _notifications) = test_client(&[node_a.address(), node_b.address()]);
    wait_connected(&client, &node_a.address()).await;
    wait_connected(&client, &node_b.address()).await;

    let (addr_a, addr_b) = (node_a.address(), node_b.address());
    let is_sibling = Arc::new(AtomicBool::new(false));
    let handler: crate::request::MultiNodeHandler = {
        let is_sibling = is_sibling.clone();
        Arc::new(
            move |mut dispatcher: crate::request::EventDispatcherMultiNode,
                  _context: RequestContext| {
                let is_sibling = is_sibling.clone();
                Box::pin(async move {
                    // The first instance fans the request out onto node B, then serves its
                    // own share on node A; the sibling serves node B.
                    let target = if !is_sibling.swap(true, Ordering::SeqCst) {
                        dispatcher.start_on_new_connection(addr_b)?;
                        addr_a
                    } else {
                        addr_b
                    };
                    let mut scope = dispatcher.use_node(target)?;
                    scope.send(|| vec![OP_PUT]).await?;
                    let reply = scope.receive().await?;
                    assert!(StatusCode::from_u8(*reply.first().unwrap())?.is_ok());
                    Ok(())
                })
            },
        )
    };
    let (notifier, finished) = capture_finished();
    client
        .requests()
        .start_multi_node(vec![], handler, notifier)
        .unwrap();

    let finished = finished_within(finished, Duration::from_secs(10)).await;
    assert!(finished.outcome.is_success());
    assert_eq!(client.requests().num_active(), 0);
    assert_eq!(
        client.requests().stats().for_type(RequestType::MultiNode).succeeded,
        1
    );
    client.shutdown().await;
}

#[tokio::test]
async fn all_nodes_request_extends_onto_nodes_added_later() {
    let node_a = MockNode::spawn(streaming_behavior()).await;
    let (client, _notifications) = test_client(&[node_a.address()]);
    wait_connected(&client, &node_a.address()).await;

    let shared = SharedWorking::new();
    let (events, mut event_rx) = mpsc::unbounded_channel();
    let (notifier, finished) = capture_finished();
    let id = client
        .requests()
        .start_all_nodes(vec![], streaming_handler(shared.clone(), events), notifier)
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(10), event_rx.recv())
        .await
        .unwrap();
    assert_eq!(event, Some("first_init"));
    assert_eq!(shared.initialised(), 1);

    // A node registered while the request is live gets its own handler instance.
    let node_b = MockNode::spawn(streaming_behavior()).await;
    assert!(client.add_node(node_b.address()));
    tokio::time::timeout(Duration::from_secs(10), async {
        while shared.initialised() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("request did not extend onto the new node");

    let controller = client
        .requests()
        .get_request_controller(id, RequestType::AllNodes)
        .unwrap();
    let stream_controller = StreamController::new(controller, shared.clone());
    assert!(stream_controller.stop(|| {}));
    let event = tokio::time::timeout(Duration::from_secs(10), event_rx.recv())
        .await
        .unwrap();
    assert_eq!(event, Some("state_changed"));

    let finished = finished_within(finished, Duration::from_secs(10)).await;
    assert!(finished.outcome.is_success());
    assert_eq!(client.requests().num_active(), 0);
    client.shutdown().await;
}

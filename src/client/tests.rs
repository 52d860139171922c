use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::{
    absolute, transaction, Address, Amount, BlockHash, Network, OutPoint, PubkeyHash,
    Transaction, TxOut, Txid,
};
use proptest::prelude::*;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::chain::{BlockStamp, FilterType, MockChainService};
use crate::client::{ChainClient, WatchRequest};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::notifications::Notification;
use crate::rescan::{MockRescanFactory, RescanFactory};

// =========================================================================
// Helpers
// =========================================================================

type TestClient = ChainClient<MockChainService>;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_address(seed: u8) -> Address {
    Address::p2pkh(PubkeyHash::from_byte_array([seed; 20]), Network::Regtest)
}

fn test_outpoint(seed: u8) -> OutPoint {
    OutPoint::new(Txid::from_byte_array([seed; 32]), 0)
}

fn fixture_with(
    factory: MockRescanFactory,
    config: ClientConfig,
) -> (Arc<MockChainService>, Arc<MockRescanFactory>, Arc<TestClient>) {
    init_logs();
    let chain = Arc::new(MockChainService::new(10));
    let factory = Arc::new(factory);
    let client = Arc::new(ChainClient::new(
        chain.clone(),
        factory.clone() as Arc<dyn RescanFactory>,
        config,
    ));
    (chain, factory, client)
}

fn fixture() -> (Arc<MockChainService>, Arc<MockRescanFactory>, Arc<TestClient>) {
    fixture_with(MockRescanFactory::new(), ClientConfig::default())
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(1), fut)
        .await
        .expect("operation did not finish within 1s")
}

async fn next_matching(
    rx: &mut UnboundedReceiver<Notification>,
    pred: impl Fn(&Notification) -> bool,
) -> Notification {
    within(async {
        loop {
            match rx.recv().await {
                Some(n) if pred(&n) => return n,
                Some(_) => continue,
                None => panic!("notification stream closed"),
            }
        }
    })
    .await
}

async fn shut_down(client: &TestClient) {
    client.stop();
    within(client.wait_for_shutdown()).await;
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_stop_cycles() {
    let (chain, factory, client) = fixture();

    for cycle in 0..5u8 {
        within(client.start()).await.unwrap();
        assert!(client.is_started());

        within(client.notify_received(&[test_address(cycle)])).await.unwrap();
        assert!(client.is_scanning());

        shut_down(&client).await;
        assert!(!client.is_started());
        assert!(!client.is_scanning());
    }

    assert_eq!(chain.start_calls(), 5);
    assert_eq!(factory.spawned_count(), 5);
    assert_eq!(factory.live_count(), 0);
}

#[tokio::test]
async fn test_wait_before_start_returns_immediately() {
    let (_chain, _factory, client) = fixture();

    client.stop();
    within(client.wait_for_shutdown()).await;
    client
        .wait_for_shutdown_timeout(Duration::from_millis(50))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let (_chain, factory, client) = fixture();

    client.start().await.unwrap();
    let notifications = client.take_notifications();
    assert!(notifications.is_some());

    client.start().await.unwrap();
    // Same generation: its stream was already handed out.
    assert!(client.take_notifications().is_none());

    client.notify_received(&[test_address(1)]).await.unwrap();
    assert_eq!(factory.spawned_count(), 1);

    shut_down(&client).await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (_chain, _factory, client) = fixture();

    client.start().await.unwrap();
    client.stop();
    client.stop();
    within(client.wait_for_shutdown()).await;
    client.stop();
    within(client.wait_for_shutdown()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_without_waiting() {
    let (_chain, factory, client) = fixture();

    client.start().await.unwrap();
    client.notify_received(&[test_address(1)]).await.unwrap();
    client.stop();

    within(client.start()).await.unwrap();
    assert!(client.is_started());
    assert_eq!(factory.live_count(), 0);

    client.notify_received(&[test_address(2)]).await.unwrap();
    assert_eq!(factory.live_count(), 1);

    shut_down(&client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_waiters() {
    let (_chain, _factory, client) = fixture();
    client.start().await.unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.wait_for_shutdown().await })
        })
        .collect();

    client.stop();
    for waiter in waiters {
        within(waiter).await.unwrap();
    }
}

#[tokio::test]
async fn test_chain_start_failure() {
    let (chain, factory, client) = fixture();
    chain.set_fail_start(true);

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, ClientError::ChainService(_)), "{err}");
    assert!(!client.is_started());

    let err = client.notify_received(&[test_address(1)]).await.unwrap_err();
    assert!(matches!(err, ClientError::NotStarted));
    assert_eq!(factory.spawned_count(), 0);

    chain.set_fail_start(false);
    client.start().await.unwrap();
    assert!(client.is_started());
    shut_down(&client).await;
}

#[tokio::test]
async fn test_request_before_start() {
    let (_chain, _factory, client) = fixture();

    let err = client.notify_received(&[test_address(1)]).await.unwrap_err();
    assert!(matches!(err, ClientError::NotStarted));

    let err = client
        .rescan(None, &[test_address(1)], &HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotStarted));
}

#[tokio::test]
async fn test_request_after_stop() {
    let (_chain, _factory, client) = fixture();

    client.start().await.unwrap();
    client.stop();

    let err = client.notify_received(&[test_address(1)]).await.unwrap_err();
    assert!(matches!(err, ClientError::Stopped));

    within(client.wait_for_shutdown()).await;
    let err = client.notify_received(&[test_address(1)]).await.unwrap_err();
    assert!(matches!(err, ClientError::Stopped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_releases_everything() {
    let (chain, factory, client) = fixture();
    let chain_refs = Arc::strong_count(&chain);
    let factory_refs = Arc::strong_count(&factory);

    client.start().await.unwrap();
    client.notify_received(&[test_address(1)]).await.unwrap();
    client
        .rescan(None, &[test_address(2)], &HashMap::new())
        .await
        .unwrap();
    assert!(Arc::strong_count(&chain) > chain_refs);

    shut_down(&client).await;

    assert_eq!(Arc::strong_count(&chain), chain_refs);
    assert_eq!(Arc::strong_count(&factory), factory_refs);
    assert_eq!(factory.live_count(), 0);
    assert!(factory.rescanners().iter().all(|r| r.is_shut_down()));
}

#[tokio::test]
async fn test_watch_list_survives_restart() {
    let (_chain, factory, client) = fixture();

    client.start().await.unwrap();
    client.notify_received(&[test_address(1)]).await.unwrap();
    shut_down(&client).await;

    client.start().await.unwrap();
    client.notify_received(&[test_address(2)]).await.unwrap();

    assert_eq!(factory.spawned_count(), 2);
    assert_eq!(
        factory.last().unwrap().watch_addrs,
        vec![test_address(1), test_address(2)]
    );

    shut_down(&client).await;
}

#[tokio::test]
async fn test_stop_interrupts_slow_update() {
    let config = ClientConfig::default()
        .with_request_timeout(Duration::from_secs(10))
        .with_update_timeout(Duration::from_secs(10));
    let factory = MockRescanFactory::new().with_update_delay(Duration::from_secs(3));
    let (_chain, factory, client) = fixture_with(factory, config);

    client.start().await.unwrap();
    client.notify_received(&[test_address(1)]).await.unwrap();

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move { client.notify_received(&[test_address(2)]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.stop();
    client
        .wait_for_shutdown_timeout(Duration::from_secs(1))
        .await
        .unwrap();

    let err = within(in_flight).await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Stopped), "{err}");
    assert_eq!(factory.live_count(), 0);
    assert!(!client.is_scanning());
}

#[tokio::test]
async fn test_stop_interrupts_slow_chain_query() {
    let config = ClientConfig::default().with_request_timeout(Duration::from_secs(10));
    let (chain, factory, client) = fixture_with(MockRescanFactory::new(), config);
    client.start().await.unwrap();

    chain.set_query_delay(Duration::from_secs(3));
    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move { client.notify_received(&[test_address(1)]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.stop();
    client
        .wait_for_shutdown_timeout(Duration::from_secs(1))
        .await
        .unwrap();

    let err = within(in_flight).await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Stopped), "{err}");
    assert_eq!(factory.spawned_count(), 0);
}

#[tokio::test]
async fn test_chain_query_timeout() {
    let config = ClientConfig::default().with_request_timeout(Duration::from_millis(200));
    let (chain, factory, client) = fixture_with(MockRescanFactory::new(), config);
    client.start().await.unwrap();

    chain.set_query_delay(Duration::from_secs(5));
    let err = client.notify_received(&[test_address(1)]).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)), "{err}");

    // The dispatcher gave up on the lookup and serves the next request in time.
    chain.set_query_delay(Duration::ZERO);
    client.notify_received(&[test_address(2)]).await.unwrap();
    assert_eq!(
        factory.last().unwrap().watch_addrs,
        vec![test_address(1), test_address(2)]
    );

    shut_down(&client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_releases_queued_requests() {
    let config = ClientConfig::default()
        .with_request_timeout(Duration::from_secs(10))
        .with_update_timeout(Duration::from_secs(10));
    let factory = MockRescanFactory::new().with_update_delay(Duration::from_secs(3));
    let (_chain, _factory, client) = fixture_with(factory, config);

    client.start().await.unwrap();
    client.notify_received(&[test_address(0)]).await.unwrap();

    // One update in flight, one parked in the channel slot, the rest blocked on send.
    let tasks: Vec<_> = (1..=5u8)
        .map(|seed| {
            let client = client.clone();
            tokio::spawn(async move { client.notify_received(&[test_address(seed)]).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.stop();
    for task in tasks {
        let err = within(task).await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Stopped), "{err}");
    }
    within(client.wait_for_shutdown()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_during_start() {
    let (chain, factory, client) = fixture();
    chain.set_start_delay(Duration::from_millis(200));

    let starting = {
        let client = client.clone();
        tokio::spawn(async move { client.start().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.stop();

    let err = within(starting).await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Stopped), "{err}");
    assert!(!client.is_started());
    within(client.wait_for_shutdown()).await;

    let err = client.notify_received(&[test_address(1)]).await.unwrap_err();
    assert!(matches!(err, ClientError::NotStarted), "{err}");

    // A later start is unaffected.
    chain.set_start_delay(Duration::ZERO);
    within(client.start()).await.unwrap();
    client.notify_received(&[test_address(1)]).await.unwrap();
    assert_eq!(factory.live_count(), 1);
    shut_down(&client).await;
}

#[tokio::test]
async fn test_notification_stream_closes_after_shutdown() {
    let (_chain, _factory, client) = fixture();

    client.start().await.unwrap();
    let mut rx = client.take_notifications().unwrap();
    client.notify_received(&[test_address(1)]).await.unwrap();
    shut_down(&client).await;

    let drained = within(async {
        let mut seen = Vec::new();
        while let Some(n) = rx.recv().await {
            seen.push(n);
        }
        seen
    })
    .await;
    assert_eq!(drained.first(), Some(&Notification::ClientConnected));
}

// =========================================================================
// Requests
// =========================================================================

#[tokio::test]
async fn test_notify_received_starts_then_updates() {
    let (chain, factory, client) = fixture();
    client.start().await.unwrap();

    for seed in 0..4 {
        client.notify_received(&[test_address(seed)]).await.unwrap();
        assert!(client.is_scanning());
    }

    assert_eq!(factory.spawned_count(), 1);
    let worker = factory.last().unwrap();
    assert_eq!(worker.start, chain.tip());
    assert_eq!(worker.end, None);
    assert_eq!(worker.watch_addrs, vec![test_address(0)]);
    assert_eq!(worker.update_count(), 3);
    assert_eq!(worker.updates()[2].addrs, vec![test_address(3)]);

    shut_down(&client).await;
}

#[tokio::test]
async fn test_duplicate_notify_still_updates() {
    let (_chain, factory, client) = fixture();
    client.start().await.unwrap();

    client.notify_received(&[test_address(1)]).await.unwrap();
    client.notify_received(&[test_address(1)]).await.unwrap();

    assert_eq!(factory.last().unwrap().update_count(), 1);
    shut_down(&client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests() {
    let (_chain, factory, client) = fixture();
    client.start().await.unwrap();

    let tasks: Vec<_> = (0..100u8)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                client.notify_received(&[test_address(i)]).await?;
                if i % 3 == 0 {
                    client.rescan(None, &[test_address(i)], &HashMap::new()).await?;
                }
                Ok::<_, ClientError>(())
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(client.is_scanning());
    assert_eq!(factory.live_count(), 1);

    // Between its seed and its updates, the last worker knows every address.
    let last = factory.last().unwrap();
    let mut known: HashSet<Address> = last.watch_addrs.iter().cloned().collect();
    known.extend(last.updates().into_iter().flat_map(|u| u.addrs));
    assert_eq!(known.len(), 100);

    shut_down(&client).await;
    assert!(!client.is_scanning());
}

#[tokio::test]
async fn test_rescan_reseeds_cumulative_watch_list() {
    let (chain, factory, client) = fixture();
    client.start().await.unwrap();

    client.notify_received(&[test_address(1)]).await.unwrap();
    client.notify_received(&[test_address(2)]).await.unwrap();

    let mut outpoints = HashMap::new();
    outpoints.insert(test_outpoint(9), test_address(4));
    client
        .rescan(None, &[test_address(3), test_address(1)], &outpoints)
        .await
        .unwrap();

    assert_eq!(factory.spawned_count(), 2);
    let first = &factory.rescanners()[0];
    assert!(first.is_shut_down());

    let worker = factory.last().unwrap();
    assert_eq!(Some(worker.start), chain.stamp_at(0));
    assert_eq!(
        worker.watch_addrs,
        vec![test_address(1), test_address(2), test_address(3)]
    );
    assert_eq!(worker.watch_inputs.len(), 1);
    assert_eq!(worker.watch_inputs[0].outpoint, test_outpoint(9));
    assert_eq!(
        worker.watch_inputs[0].script_pubkey,
        test_address(4).script_pubkey()
    );

    shut_down(&client).await;
}

#[tokio::test]
async fn test_rescan_range() {
    let (chain, factory, client) = fixture();
    client.start().await.unwrap();

    let start = chain.stamp_at(3).unwrap();
    let end = chain.stamp_at(7).unwrap();
    let request = WatchRequest::new()
        .with_addrs([test_address(1)])
        .from_block(start.hash)
        .to_block(end.hash);
    client.rescan_with(request).await.unwrap();

    let worker = factory.last().unwrap();
    assert_eq!(worker.start, start);
    assert_eq!(worker.end, Some(end));

    shut_down(&client).await;
}

#[tokio::test]
async fn test_rescan_at_tip_reports_finished() {
    let (chain, _factory, client) = fixture();
    client.start().await.unwrap();
    let mut rx = client.take_notifications().unwrap();

    let tip = chain.tip();
    client
        .rescan(Some(tip.hash), &[test_address(1)], &HashMap::new())
        .await
        .unwrap();

    let finished = next_matching(&mut rx, |n| matches!(n, Notification::RescanFinished(_))).await;
    assert_eq!(finished, Notification::RescanFinished(tip));

    shut_down(&client).await;
}

#[tokio::test]
async fn test_rescan_unknown_start_keeps_worker() {
    let (_chain, factory, client) = fixture();
    client.start().await.unwrap();
    client.notify_received(&[test_address(1)]).await.unwrap();

    let unknown = BlockHash::from_byte_array([0xab; 32]);
    let err = client
        .rescan(Some(unknown), &[test_address(2)], &HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ChainService(_)), "{err}");

    assert!(client.is_scanning());
    assert_eq!(factory.spawned_count(), 1);
    assert!(!factory.last().unwrap().is_shut_down());

    // The address from the failed request is still watched by the next worker.
    client.rescan(None, &[], &HashMap::new()).await.unwrap();
    assert_eq!(
        factory.last().unwrap().watch_addrs,
        vec![test_address(1), test_address(2)]
    );

    shut_down(&client).await;
}

#[tokio::test]
async fn test_factory_failure_leaves_client_idle() {
    let (_chain, factory, client) = fixture();
    client.start().await.unwrap();

    factory.fail_next(1);
    let err = client.notify_received(&[test_address(1)]).await.unwrap_err();
    assert!(matches!(err, ClientError::RescanSetup(_)), "{err}");
    assert!(!client.is_scanning());

    client.notify_received(&[test_address(2)]).await.unwrap();
    assert!(client.is_scanning());
    assert_eq!(
        factory.last().unwrap().watch_addrs,
        vec![test_address(1), test_address(2)]
    );

    shut_down(&client).await;
}

#[tokio::test]
async fn test_factory_failure_during_restart() {
    let (_chain, factory, client) = fixture();
    client.start().await.unwrap();
    client.notify_received(&[test_address(1)]).await.unwrap();

    factory.fail_next(1);
    let err = client
        .rescan(None, &[test_address(2)], &HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::RescanSetup(_)), "{err}");

    assert!(!client.is_scanning());
    assert_eq!(factory.live_count(), 0);
    assert!(factory.last().unwrap().is_shut_down());

    shut_down(&client).await;
}

#[tokio::test]
async fn test_slow_update_times_out() {
    let config = ClientConfig::default().with_update_timeout(Duration::from_millis(50));
    let factory = MockRescanFactory::new().with_update_delay(Duration::from_millis(500));
    let (_chain, factory, client) = fixture_with(factory, config);
    client.start().await.unwrap();

    client.notify_received(&[test_address(1)]).await.unwrap();
    let err = client.notify_received(&[test_address(2)]).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)), "{err}");

    // The worker stays in place.
    assert!(client.is_scanning());
    assert_eq!(factory.spawned_count(), 1);

    shut_down(&client).await;
}

#[tokio::test]
async fn test_request_timeout() {
    let config = ClientConfig::default().with_request_timeout(Duration::from_millis(50));
    let factory = MockRescanFactory::new().with_update_delay(Duration::from_millis(300));
    let (_chain, _factory, client) = fixture_with(factory, config);
    client.start().await.unwrap();

    client.notify_received(&[test_address(1)]).await.unwrap();
    let err = client.notify_received(&[test_address(2)]).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)), "{err}");

    shut_down(&client).await;
}

#[tokio::test]
async fn test_worker_errors_forwarded() {
    let factory = MockRescanFactory::new().with_errors(["peer disconnected"]);
    let (_chain, _factory, client) = fixture_with(factory, ClientConfig::default());
    client.start().await.unwrap();
    let mut rx = client.take_notifications().unwrap();

    let connected = next_matching(&mut rx, |_| true).await;
    assert_eq!(connected, Notification::ClientConnected);

    client.notify_received(&[test_address(1)]).await.unwrap();
    let forwarded = next_matching(&mut rx, |n| matches!(n, Notification::RescanError(_))).await;
    assert_eq!(
        forwarded,
        Notification::RescanError("peer disconnected".to_string())
    );

    // A closed worker stream does not end the scan.
    client.notify_received(&[test_address(2)]).await.unwrap();
    assert!(client.is_scanning());

    shut_down(&client).await;
}

#[tokio::test]
async fn test_worker_notifications_reach_consumer() {
    let stamp = BlockStamp::new(5, BlockHash::all_zeros());
    let factory = MockRescanFactory::new().with_notifications(vec![
        Notification::BlockConnected(stamp),
        Notification::RescanProgress(stamp),
    ]);
    let (_chain, _factory, client) = fixture_with(factory, ClientConfig::default());

    client.start().await.unwrap();
    let mut rx = client.take_notifications().unwrap();
    client.notify_received(&[test_address(1)]).await.unwrap();

    let progress = next_matching(&mut rx, |n| matches!(n, Notification::RescanProgress(_))).await;
    assert_eq!(progress, Notification::RescanProgress(stamp));

    shut_down(&client).await;
}

// =========================================================================
// Chain pass-through
// =========================================================================

#[tokio::test]
async fn test_chain_queries() {
    let (chain, _factory, client) = fixture();
    let tip = chain.tip();

    assert_eq!(client.backend(), "cfilter");
    assert_eq!(client.get_best_block().await.unwrap(), (tip.hash, tip.height));
    assert_eq!(client.block_stamp().await.unwrap(), tip);
    assert_eq!(client.get_block_height(tip.hash).await.unwrap(), tip.height);
    assert_eq!(client.get_block_hash(tip.height).await.unwrap(), tip.hash);

    let header = client.get_block_header(tip.hash).await.unwrap();
    assert_eq!(header.prev_blockhash, chain.stamp_at(tip.height - 1).unwrap().hash);
    assert_eq!(client.get_block(tip.hash).await.unwrap().block_hash(), tip.hash);
    assert!(client.get_cfilter(tip.hash, FilterType::Basic).await.is_ok());

    let unknown = BlockHash::from_byte_array([0xcd; 32]);
    let err = client.get_block(unknown).await.unwrap_err();
    assert!(matches!(err, ClientError::ChainService(_)));

    assert!(!client.is_current());
    chain.set_current(true);
    assert!(client.is_current());
}

#[tokio::test]
async fn test_send_raw_transaction() {
    let (chain, _factory, client) = fixture();
    let tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: Vec::new(),
        output: vec![TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: test_address(7).script_pubkey(),
        }],
    };

    let txid = client.send_raw_transaction(&tx).await.unwrap();
    assert_eq!(txid, tx.compute_txid());
    assert_eq!(chain.sent_transactions(), vec![tx]);
}

// =========================================================================
// Properties
// =========================================================================

#[derive(Debug, Clone, Copy)]
enum Op {
    Notify(u8),
    Rescan(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<u8>().prop_map(Op::Notify),
        1 => any::<u8>().prop_map(Op::Rescan),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_worker_count_follows_requests(ops in prop::collection::vec(op_strategy(), 1..20)) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let (spawned, updates, live_after) = runtime.block_on(async {
            let (_chain, factory, client) = fixture();
            client.start().await.unwrap();

            for op in &ops {
                match *op {
                    Op::Notify(seed) => client.notify_received(&[test_address(seed)]).await.unwrap(),
                    Op::Rescan(seed) => client
                        .rescan(None, &[test_address(seed)], &HashMap::new())
                        .await
                        .unwrap(),
                }
            }
            let counts = (factory.spawned_count(), factory.total_updates());
            shut_down(&client).await;
            (counts.0, counts.1, factory.live_count())
        });

        let mut scanning = false;
        let (mut expected_spawned, mut expected_updates) = (0, 0);
        for op in &ops {
            match op {
                Op::Notify(_) if scanning => expected_updates += 1,
                Op::Notify(_) | Op::Rescan(_) => {
                    expected_spawned += 1;
                    scanning = true;
                }
            }
        }

        prop_assert_eq!(spawned, expected_spawned);
        prop_assert_eq!(updates, expected_updates);
        prop_assert_eq!(live_after, 0);
    }
}

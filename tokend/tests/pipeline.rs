// tests/pipeline.rs
// End-to-end runs of the pipeline: requests go in at the front, Avro-encoded
// sink messages come out at the back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tower::ServiceExt;

use tokend::aggregator::{AddrAggregator, SimpleAggregator};
use tokend::config::Config;
use tokend::message::{avro_decode, sink_schema, Justification, SinkMessage};
use tokend::pipeline::{Aggregator, ClientRequest, Item, STAGE_CHANNEL_CAPACITY};
use tokend::receiver::web::router;
use tokend::tokenizer::{HmacTokenizer, Token, Tokenize, VerbatimTokenizer};

const WALLET: &str = "315c140b-3ae3-4300-a8a1-daf7b008ccb2";

fn test_config(fwd_interval: Duration) -> Config {
    Config {
        port: 8080,
        fwd_interval,
        key_expiry: Duration::from_secs(3600),
        kafka: None,
    }
}

struct Pipeline {
    aggregator: AddrAggregator,
    tokenizer: Arc<VerbatimTokenizer>,
    inbox: mpsc::Sender<Item>,
    outbox: mpsc::Receiver<Token>,
}

/// Wires a verbatim-tokenizing address aggregator to raw channels.
async fn start_pipeline(fwd_interval: Duration) -> Pipeline {
    let (in_tx, in_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(16);

    let tokenizer = Arc::new(VerbatimTokenizer::new());
    let mut aggregator = AddrAggregator::new(Arc::new(sink_schema().unwrap()));
    aggregator.set_config(&test_config(fwd_interval));
    aggregator.use_tokenizer(tokenizer.clone());
    aggregator.connect(in_rx, out_tx);
    aggregator.start().await.unwrap();

    Pipeline {
        aggregator,
        tokenizer,
        inbox: in_tx,
        outbox: out_rx,
    }
}

fn request(addr: &str, wallet: &str) -> Item {
    Item::Request(ClientRequest {
        addr: addr.parse().unwrap(),
        wallet: wallet.parse().unwrap(),
    })
}

async fn next_message(outbox: &mut mpsc::Receiver<Token>) -> SinkMessage {
    let datum = timeout(Duration::from_secs(5), outbox.recv())
        .await
        .expect("timed out waiting for a sink message")
        .expect("outbox closed");
    avro_decode(&sink_schema().unwrap(), &datum).unwrap()
}

fn justification(msg: &SinkMessage) -> Justification {
    serde_json::from_str(&msg.justification).unwrap()
}

#[tokio::test]
async fn aggregates_addresses_per_wallet() {
    let mut p = start_pipeline(Duration::from_millis(100)).await;

    p.inbox.send(request("1.2.3.4", WALLET)).await.unwrap();
    p.inbox.send(request("2.3.4.5", WALLET)).await.unwrap();

    let msg = next_message(&mut p.outbox).await;
    assert_eq!(msg.wallet_id, WALLET);
    assert_eq!(msg.service, "ADS");
    assert_eq!(msg.signal, "ANON_IP_ADDRS");
    assert_eq!(msg.score, 0);

    let j = justification(&msg);
    let addrs: HashSet<String> = j.addrs.into_iter().collect();
    assert_eq!(
        addrs,
        HashSet::from(["1.2.3.4".to_string(), "2.3.4.5".to_string()])
    );
    assert_eq!(j.keyid, p.tokenizer.key_id().unwrap());

    p.aggregator.stop().await;
}

#[tokio::test]
async fn duplicate_submissions_collapse() {
    let mut p = start_pipeline(Duration::from_millis(100)).await;

    p.inbox.send(request("1.2.3.4", WALLET)).await.unwrap();
    p.inbox.send(request("1.2.3.4", WALLET)).await.unwrap();

    let msg = next_message(&mut p.outbox).await;
    assert_eq!(justification(&msg).addrs, vec!["1.2.3.4".to_string()]);

    p.aggregator.stop().await;
}

#[tokio::test]
async fn key_rotation_splits_epochs() {
    let mut p = start_pipeline(Duration::from_millis(200)).await;

    p.inbox.send(request("1.2.3.4", WALLET)).await.unwrap();
    // Give the aggregator a chance to process the first request under the
    // old key before rotating.
    tokio::time::sleep(Duration::from_millis(50)).await;
    p.tokenizer.reset_key();
    p.inbox.send(request("1.2.3.4", WALLET)).await.unwrap();

    let first = next_message(&mut p.outbox).await;
    let second = next_message(&mut p.outbox).await;

    // Both messages belong to the same wallet but to different epochs.
    assert_eq!(first.wallet_id, WALLET);
    assert_eq!(second.wallet_id, WALLET);
    assert_ne!(justification(&first).keyid, justification(&second).keyid);

    p.aggregator.stop().await;
}

#[tokio::test]
async fn created_at_is_rfc3339() {
    let mut p = start_pipeline(Duration::from_millis(100)).await;

    p.inbox.send(request("1.2.3.4", WALLET)).await.unwrap();
    let msg = next_message(&mut p.outbox).await;
    let parsed = chrono::DateTime::parse_from_rfc3339(&msg.created_at).unwrap();
    assert_eq!(parsed.timezone().utc_minus_local(), 0);

    p.aggregator.stop().await;
}

#[tokio::test]
async fn http_front_door_to_sink_message() {
    let (in_tx, in_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let app = router(in_tx);

    let tokenizer = Arc::new(VerbatimTokenizer::new());
    let mut aggregator = AddrAggregator::new(Arc::new(sink_schema().unwrap()));
    aggregator.set_config(&test_config(Duration::from_millis(100)));
    aggregator.use_tokenizer(tokenizer);
    aggregator.connect(in_rx, out_tx);
    aggregator.start().await.unwrap();

    for addr in ["1.2.3.4", "2.3.4.5"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/v2/confirmation/token/{WALLET}"))
                    .header("Fastly-Client-IP", addr)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let msg = next_message(&mut out_rx).await;
    assert_eq!(msg.wallet_id, WALLET);
    let addrs: HashSet<String> = justification(&msg).addrs.into_iter().collect();
    assert_eq!(
        addrs,
        HashSet::from(["1.2.3.4".to_string(), "2.3.4.5".to_string()])
    );

    aggregator.stop().await;
}

#[tokio::test]
async fn blobs_bypass_aggregation() {
    let mut p = start_pipeline(Duration::from_secs(300)).await;

    // Opaque blobs are tokenized and forwarded immediately, long before any
    // flush tick.
    p.inbox
        .send(Item::Blob(b"opaque record".to_vec()))
        .await
        .unwrap();

    let token = timeout(Duration::from_secs(5), p.outbox.recv())
        .await
        .expect("timed out waiting for a forwarded blob")
        .expect("outbox closed");
    assert_eq!(token, b"opaque record".to_vec());

    p.aggregator.stop().await;
}

#[tokio::test]
async fn simple_aggregator_forwards_keyed_macs() {
    let (in_tx, in_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);

    let mut aggregator = SimpleAggregator::new();
    aggregator.use_tokenizer(Arc::new(HmacTokenizer::new()));
    aggregator.connect(in_rx, out_tx);
    aggregator.start().await.unwrap();

    in_tx
        .send(Item::Blob(b"203.0.113.7".to_vec()))
        .await
        .unwrap();

    let token = timeout(Duration::from_secs(5), out_rx.recv())
        .await
        .expect("timed out waiting for a token")
        .expect("outbox closed");
    assert_eq!(token.len(), 32);
    assert_ne!(token, b"203.0.113.7".to_vec());

    aggregator.stop().await;
}

#[tokio::test]
async fn no_flush_without_input() {
    let mut p = start_pipeline(Duration::from_millis(50)).await;

    // Several flush ticks pass; an empty batch must not produce messages.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(p.outbox.try_recv().is_err());

    p.aggregator.stop().await;
}

// src/forwarder/kafka.rs
// The broker forwarder caches tokens until the cache is large or old
// enough, then writes the whole batch to the broker in one produce call.
// Delivery is at most once: the cache is drained before the write, so a
// transport failure loses the current batch and the next one starts clean.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::ClientBuilder;
use rskafka::record::Record;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use super::cache::TokenCache;
use crate::config::{Config, KafkaConfig};
use crate::metrics::{fail_because, METRICS, OUTCOME_SUCCESS};
use crate::pipeline::{Forwarder, STAGE_CHANNEL_CAPACITY};
use crate::tokenizer::Token;

/// How often the worker re-checks the cache when no tokens arrive, so
/// age-based flushes happen even on an idle channel.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The broker write path. Split out so tests can observe batches without a
/// running broker.
#[async_trait]
pub(crate) trait BrokerSink: Send + Sync {
    /// Writes all tokens as distinct messages in a single call.
    async fn write_all(&self, tokens: Vec<Token>) -> Result<()>;
}

struct PartitionSink {
    partition: PartitionClient,
}

#[async_trait]
impl BrokerSink for PartitionSink {
    async fn write_all(&self, tokens: Vec<Token>) -> Result<()> {
        let records: Vec<Record> = tokens
            .into_iter()
            .map(|token| Record {
                key: None,
                value: Some(token),
                headers: BTreeMap::new(),
                timestamp: Utc::now(),
            })
            .collect();
        self.partition
            .produce(records, Compression::NoCompression)
            .await
            .context("failed to forward tokens to the broker")?;
        Ok(())
    }
}

pub struct KafkaForwarder {
    conf: Option<KafkaConfig>,
    outbox_tx: mpsc::Sender<Token>,
    outbox_rx: Option<mpsc::Receiver<Token>>,
    shutdown: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

impl KafkaForwarder {
    pub fn new() -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        Self {
            conf: None,
            outbox_tx,
            outbox_rx: Some(outbox_rx),
            shutdown: None,
            worker: None,
        }
    }
}

impl Default for KafkaForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Forwarder for KafkaForwarder {
    fn set_config(&mut self, config: &Config) {
        self.conf = config.kafka.clone();
    }

    fn outbox(&self) -> mpsc::Sender<Token> {
        self.outbox_tx.clone()
    }

    async fn start(&mut self) -> Result<()> {
        let conf = self
            .conf
            .clone()
            .context("Kafka forwarder is missing its configuration")?;
        let outbox = self
            .outbox_rx
            .take()
            .context("Kafka forwarder can only be started once")?;

        let client = ClientBuilder::new(vec![conf.broker.clone()])
            .tls_config(conf.tls.clone())
            .build()
            .await
            .with_context(|| format!("failed to connect to broker '{}'", conf.broker))?;
        let partition = client
            .partition_client(conf.topic.clone(), 0, UnknownTopicHandling::Retry)
            .await
            .with_context(|| format!("failed to open topic '{}'", conf.topic))?;
        info!(
            "Created Kafka writer for {:?} using topic {:?}.",
            conf.broker, conf.topic
        );

        let sink = Arc::new(PartitionSink { partition });
        let cache = TokenCache::start(conf.batch_size, conf.batch_period);
        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);
        self.worker = Some(tokio::spawn(async move {
            worker_loop(outbox, sink, cache, rx).await;
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        info!("Stopped Kafka forwarder.");
    }
}

async fn worker_loop(
    mut outbox: mpsc::Receiver<Token>,
    sink: Arc<dyn BrokerSink>,
    cache: TokenCache,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut poll = time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            token = outbox.recv() => match token {
                None => break,
                Some(token) => {
                    if token.is_empty() {
                        METRICS.count_forwarded(&fail_because(&"nothing to forward"));
                        continue;
                    }
                    cache.submit(token).await;
                }
            },
            _ = poll.tick() => {}
        }

        if cache.is_ready().await {
            flush(sink.as_ref(), &cache).await;
        }
    }
    cache.stop().await;
}

/// Drains the cache and writes the batch. The drain happens first, so a
/// failed write loses the batch instead of repeating it.
async fn flush(sink: &dyn BrokerSink, cache: &TokenCache) {
    let tokens = match cache.retrieve().await {
        Ok(tokens) => tokens,
        Err(_) => return,
    };
    let count = tokens.len();

    match sink.write_all(tokens).await {
        Ok(()) => {
            METRICS.count_forwarded(OUTCOME_SUCCESS);
            info!("Sent {count} token(s) to the broker.");
        }
        Err(e) => {
            METRICS.count_forwarded(&fail_because(&e));
            warn!("Lost a batch of {count} token(s): {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use parking_lot::Mutex;

    use super::*;

    /// Records batches instead of talking to a broker. Fails every write
    /// while `fail` is set.
    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<Token>>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl BrokerSink for RecordingSink {
        async fn write_all(&self, tokens: Vec<Token>) -> Result<()> {
            if *self.fail.lock() {
                return Err(anyhow!("broker unreachable"));
            }
            self.batches.lock().push(tokens);
            Ok(())
        }
    }

    struct Harness {
        outbox: mpsc::Sender<Token>,
        sink: Arc<RecordingSink>,
        shutdown: watch::Sender<bool>,
        worker: JoinHandle<()>,
    }

    fn start_worker(batch_size: usize, batch_period: Duration) -> Harness {
        let (outbox, outbox_rx) = mpsc::channel(8);
        let sink = Arc::new(RecordingSink::default());
        let cache = TokenCache::start(batch_size, batch_period);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(worker_loop(
            outbox_rx,
            sink.clone(),
            cache,
            shutdown_rx,
        ));
        Harness {
            outbox,
            sink,
            shutdown,
            worker,
        }
    }

    impl Harness {
        async fn stop(self) {
            let _ = self.shutdown.send(true);
            let _ = self.worker.await;
        }
    }

    #[tokio::test]
    async fn size_threshold_flushes_once() {
        let h = start_worker(2, Duration::from_secs(60));

        for token in [vec![1u8], vec![2], vec![3]] {
            h.outbox.send(token).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let batches = h.sink.batches.lock().clone();
        assert_eq!(batches, vec![vec![vec![1u8], vec![2], vec![3]]]);
        h.stop().await;
    }

    #[tokio::test]
    async fn age_threshold_flushes_a_single_token() {
        let h = start_worker(1000, Duration::from_millis(20));

        h.outbox.send(vec![7u8]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let batches = h.sink.batches.lock().clone();
        assert_eq!(batches, vec![vec![vec![7u8]]]);
        h.stop().await;
    }

    #[tokio::test]
    async fn failed_write_loses_the_batch() {
        let h = start_worker(1, Duration::from_secs(60));
        *h.sink.fail.lock() = true;

        h.outbox.send(vec![1u8]).await.unwrap();
        h.outbox.send(vec![2u8]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The batch was dropped; a later batch makes it through cleanly.
        *h.sink.fail.lock() = false;
        h.outbox.send(vec![3u8]).await.unwrap();
        h.outbox.send(vec![4u8]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let batches = h.sink.batches.lock().clone();
        assert_eq!(batches, vec![vec![vec![3u8], vec![4u8]]]);
        h.stop().await;
    }

    #[tokio::test]
    async fn empty_tokens_are_not_cached() {
        let h = start_worker(0, Duration::from_secs(60));

        h.outbox.send(Vec::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(h.sink.batches.lock().is_empty());
        h.stop().await;
    }
}

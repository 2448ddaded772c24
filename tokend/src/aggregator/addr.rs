// src/aggregator/addr.rs
// The address aggregator groups tokenized addresses by key epoch and wallet
// and periodically flushes the whole batch downstream. It also drives key
// rotation, so a single batch can legitimately span multiple epochs.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use apache_avro::Schema;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::Config;
use crate::message::{compile_sink_msg, EpochBatch};
use crate::metrics::{fail_because, METRICS, OUTCOME_SUCCESS};
use crate::pipeline::{ip_bytes, Aggregator, ClientRequest, Item};
use crate::tokenizer::{Token, Tokenize};

pub struct AddrAggregator {
    fwd_interval: Duration,
    key_expiry: Duration,
    schema: Arc<Schema>,
    tokenizer: Option<Arc<dyn Tokenize>>,
    inbox: Option<mpsc::Receiver<Item>>,
    outbox: Option<mpsc::Sender<Token>>,
    shutdown: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

impl AddrAggregator {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            fwd_interval: Duration::from_secs(300),
            key_expiry: Duration::from_secs(15_552_000),
            schema,
            tokenizer: None,
            inbox: None,
            outbox: None,
            shutdown: None,
            worker: None,
        }
    }
}

#[async_trait]
impl Aggregator for AddrAggregator {
    fn set_config(&mut self, config: &Config) {
        self.fwd_interval = config.fwd_interval;
        self.key_expiry = config.key_expiry;
        info!(
            "Forward interval: {:?}, key expiry: {:?}",
            self.fwd_interval, self.key_expiry
        );
    }

    fn use_tokenizer(&mut self, tokenizer: Arc<dyn Tokenize>) {
        self.tokenizer = Some(tokenizer);
    }

    fn connect(&mut self, inbox: mpsc::Receiver<Item>, outbox: mpsc::Sender<Token>) {
        self.inbox = Some(inbox);
        self.outbox = Some(outbox);
    }

    async fn start(&mut self) -> Result<()> {
        let tokenizer = self
            .tokenizer
            .clone()
            .context("no tokenizer attached to address aggregator")?;
        let inbox = self
            .inbox
            .take()
            .context("address aggregator has no inbox")?;
        let outbox = self
            .outbox
            .clone()
            .context("address aggregator has no outbox")?;

        // Make sure we never tokenize with an uninitialized key.
        tokenizer.reset_key();

        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);
        let schema = self.schema.clone();
        let fwd_interval = self.fwd_interval;
        let key_expiry = self.key_expiry;
        self.worker = Some(tokio::spawn(async move {
            worker_loop(inbox, outbox, tokenizer, schema, fwd_interval, key_expiry, rx).await;
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
        info!("Stopped address aggregator.");
    }
}

async fn worker_loop(
    mut inbox: mpsc::Receiver<Item>,
    outbox: mpsc::Sender<Token>,
    tokenizer: Arc<dyn Tokenize>,
    schema: Arc<Schema>,
    fwd_interval: Duration,
    key_expiry: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batch = EpochBatch::new();
    let start = time::Instant::now();
    let mut fwd_ticker = time::interval_at(start + fwd_interval, fwd_interval);
    let mut key_ticker = time::interval_at(start + key_expiry, key_expiry);

    info!("Starting address aggregator loop.");
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = fwd_ticker.tick() => {
                if let Err(e) = flush(&mut batch, &outbox, &schema).await {
                    warn!("Failed to forward addresses: {e}");
                }
            }
            _ = key_ticker.tick() => tokenizer.reset_key(),
            item = inbox.recv() => match item {
                None => return,
                Some(Item::Request(req)) => {
                    match process_request(&mut batch, tokenizer.as_ref(), &req) {
                        Ok(()) => debug!("Processed request for wallet {}.", req.wallet),
                        Err(e) => {
                            METRICS.count_tokenized(&fail_because(&e));
                            warn!("Failed to process client request: {e}");
                        }
                    }
                }
                Some(item @ Item::Blob(_)) => {
                    // We are not prepared to aggregate whatever we were
                    // given. Tokenize it and forward it right away.
                    match tokenizer.tokenize(&item.bytes()) {
                        Ok(token) => {
                            METRICS.count_tokenized(OUTCOME_SUCCESS);
                            if outbox.send(token).await.is_err() {
                                return;
                            }
                            debug!("Item not aggregatable; tokenized and forwarded.");
                        }
                        Err(e) => {
                            METRICS.count_tokenized(&fail_because(&e));
                            warn!("Failed to tokenize blob: {e}");
                        }
                    }
                }
            }
        }
    }
}

/// Tokenizes the request's address and files it into the batch under the
/// current key epoch and the request's wallet.
fn process_request(
    batch: &mut EpochBatch,
    tokenizer: &dyn Tokenize,
    req: &ClientRequest,
) -> Result<()> {
    let (raw_token, key_id) = tokenizer.tokenize_with_key_id(&ip_bytes(req.addr))?;
    let token = encode_token(&raw_token, tokenizer.preserves_len())?;

    batch.insert(key_id, req.wallet, token);
    METRICS.count_tokenized(OUTCOME_SUCCESS);
    METRICS.set_pending(batch.num_wallets() as u64, batch.num_addrs() as u64);
    Ok(())
}

/// Turns a raw token into its string encoding. Length-preserving tokenizers
/// hand back IP-sized tokens, which we render as canonical address strings;
/// everything else is Base64.
fn encode_token(raw: &[u8], preserves_len: bool) -> Result<String> {
    if !preserves_len {
        return Ok(BASE64.encode(raw));
    }
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().expect("length checked above");
            Ok(Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().expect("length checked above");
            Ok(Ipv6Addr::from(octets).to_string())
        }
        _ => bail!("token is neither of IPv4 nor IPv6 length"),
    }
}

/// Drains the batch and sends one message per (epoch, wallet) pair. The
/// batch is cleared before sending, so a failed send loses the remainder of
/// the batch rather than duplicating it later.
async fn flush(
    batch: &mut EpochBatch,
    outbox: &mpsc::Sender<Token>,
    schema: &Schema,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let drained = batch.take();
    let num_addrs = drained.num_addrs();
    METRICS.set_pending(0, 0);

    for (key_id, wallets) in drained.iter() {
        for (wallet, addrs) in wallets {
            let msg = compile_sink_msg(schema, *key_id, *wallet, addrs)?;
            outbox
                .send(msg)
                .await
                .context("forwarder is gone; dropping batch")?;
        }
    }
    info!("Forwarded {num_addrs} address(es).");
    Ok(())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::message::sink_schema;
    use crate::tokenizer::{HmacTokenizer, VerbatimTokenizer};

    fn request(addr: &str, wallet: Uuid) -> ClientRequest {
        ClientRequest {
            addr: addr.parse().unwrap(),
            wallet,
        }
    }

    #[test]
    fn groups_addresses_by_wallet() {
        let tokenizer = VerbatimTokenizer::new();
        tokenizer.reset_key();
        let wallet = Uuid::new_v4();
        let mut batch = EpochBatch::new();

        process_request(&mut batch, &tokenizer, &request("1.2.3.4", wallet)).unwrap();
        process_request(&mut batch, &tokenizer, &request("2.3.4.5", wallet)).unwrap();

        let mut expected = EpochBatch::new();
        let key_id = tokenizer.key_id().unwrap();
        expected.insert(key_id, wallet, "1.2.3.4".to_string());
        expected.insert(key_id, wallet, "2.3.4.5".to_string());
        assert_eq!(batch, expected);
    }

    #[test]
    fn absorbs_duplicate_requests() {
        let tokenizer = VerbatimTokenizer::new();
        tokenizer.reset_key();
        let wallet = Uuid::new_v4();
        let mut batch = EpochBatch::new();

        process_request(&mut batch, &tokenizer, &request("1.2.3.4", wallet)).unwrap();
        process_request(&mut batch, &tokenizer, &request("1.2.3.4", wallet)).unwrap();

        assert_eq!(batch.num_addrs(), 1);
    }

    #[test]
    fn rotation_opens_a_new_epoch() {
        let tokenizer = VerbatimTokenizer::new();
        tokenizer.reset_key();
        let wallet = Uuid::new_v4();
        let mut batch = EpochBatch::new();

        process_request(&mut batch, &tokenizer, &request("1.2.3.4", wallet)).unwrap();
        tokenizer.reset_key();
        process_request(&mut batch, &tokenizer, &request("1.2.3.4", wallet)).unwrap();

        // Same wallet and address, but two epochs.
        assert_eq!(batch.num_wallets(), 2);
        assert_eq!(batch.num_addrs(), 2);
    }

    #[test]
    fn hmac_tokens_are_base64() {
        let tokenizer = HmacTokenizer::new();
        tokenizer.reset_key();
        let raw = tokenizer.tokenize(&[1, 2, 3, 4]).unwrap();
        let encoded = encode_token(&raw, tokenizer.preserves_len()).unwrap();
        assert_eq!(BASE64.decode(encoded).unwrap(), raw);
    }

    #[test]
    fn ip_sized_tokens_render_as_addresses() {
        assert_eq!(encode_token(&[1, 2, 3, 4], true).unwrap(), "1.2.3.4");
        let mut v6 = [0u8; 16];
        v6[15] = 1;
        assert_eq!(encode_token(&v6, true).unwrap(), "::1");
    }

    #[test]
    fn odd_length_preserving_tokens_are_rejected() {
        assert!(encode_token(&[1, 2, 3], true).is_err());
        assert!(encode_token(&[0u8; 32], true).is_err());
    }

    #[tokio::test]
    async fn flush_on_empty_batch_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(1);
        let schema = sink_schema().unwrap();
        let mut batch = EpochBatch::new();

        flush(&mut batch, &tx, &schema).await.unwrap();
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn flush_emits_one_message_per_wallet() {
        let (tx, mut rx) = mpsc::channel(4);
        let schema = sink_schema().unwrap();
        let key_id = crate::tokenizer::KeyId(Uuid::new_v4());
        let (w1, w2) = (Uuid::new_v4(), Uuid::new_v4());

        let mut batch = EpochBatch::new();
        batch.insert(key_id, w1, "1.1.1.1".to_string());
        batch.insert(key_id, w1, "2.2.2.2".to_string());
        batch.insert(key_id, w2, "3.3.3.3".to_string());

        flush(&mut batch, &tx, &schema).await.unwrap();
        assert!(batch.is_empty());

        drop(tx);
        let mut msgs = Vec::new();
        while let Some(m) = rx.recv().await {
            msgs.push(m);
        }
        assert_eq!(msgs.len(), 2);

        let mut seen: Vec<(String, Vec<String>)> = msgs
            .iter()
            .map(|datum| {
                let msg = crate::message::avro_decode(&schema, datum).unwrap();
                let j: crate::message::Justification =
                    serde_json::from_str(&msg.justification).unwrap();
                assert_eq!(j.keyid, key_id);
                (msg.wallet_id, j.addrs)
            })
            .collect();
        seen.sort();

        let mut expected = vec![
            (
                w1.to_string(),
                vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()],
            ),
            (w2.to_string(), vec!["3.3.3.3".to_string()]),
        ];
        expected.sort();
        assert_eq!(seen, expected);
    }
}

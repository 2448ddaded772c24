// src/aggregator/simple.rs
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::metrics::{fail_because, METRICS, OUTCOME_SUCCESS};
use crate::pipeline::{Aggregator, Item};
use crate::tokenizer::{Token, Tokenize};

/// An aggregator that does nothing but tokenizing incoming items and
/// passing them on. No grouping, no flush schedule.
pub struct SimpleAggregator {
    tokenizer: Option<Arc<dyn Tokenize>>,
    inbox: Option<mpsc::Receiver<Item>>,
    outbox: Option<mpsc::Sender<Token>>,
    shutdown: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

impl SimpleAggregator {
    pub fn new() -> Self {
        Self {
            tokenizer: None,
            inbox: None,
            outbox: None,
            shutdown: None,
            worker: None,
        }
    }
}

impl Default for SimpleAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Aggregator for SimpleAggregator {
    fn set_config(&mut self, _config: &Config) {}

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
            .context("no tokenizer attached to simple aggregator")?;
        let mut inbox = self
            .inbox
            .take()
            .context("simple aggregator has no inbox")?;
        let outbox = self
            .outbox
            .clone()
            .context("simple aggregator has no outbox")?;

        tokenizer.reset_key();

        let (tx, mut rx) = watch::channel(false);
        self.shutdown = Some(tx);
        self.worker = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => return,
                    item = inbox.recv() => match item {
                        None => return,
                        Some(item) => match tokenizer.tokenize(&item.bytes()) {
                            Ok(token) => {
                                METRICS.count_tokenized(OUTCOME_SUCCESS);
                                if outbox.send(token).await.is_err() {
                                    return;
                                }
                                debug!("Sent token to forwarder.");
                            }
                            Err(e) => {
                                METRICS.count_tokenized(&fail_because(&e));
                                warn!("Failed to tokenize item: {e}");
                            }
                        }
                    }
                }
            }
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
        info!("Stopped simple aggregator.");
    }
}

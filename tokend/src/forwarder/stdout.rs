// src/forwarder/stdout.rs
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::pipeline::{Forwarder, STAGE_CHANNEL_CAPACITY};
use crate::tokenizer::Token;

/// A forwarder that prints every token to stdout, one per line. No
/// batching.
pub struct StdoutForwarder {
    outbox_tx: mpsc::Sender<Token>,
    outbox_rx: Option<mpsc::Receiver<Token>>,
    shutdown: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

impl StdoutForwarder {
    pub fn new() -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        Self {
            outbox_tx,
            outbox_rx: Some(outbox_rx),
            shutdown: None,
            worker: None,
        }
    }
}

impl Default for StdoutForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Forwarder for StdoutForwarder {
    fn set_config(&mut self, _config: &Config) {}

    fn outbox(&self) -> mpsc::Sender<Token> {
        self.outbox_tx.clone()
    }

    async fn start(&mut self) -> Result<()> {
        let mut outbox = self
            .outbox_rx
            .take()
            .expect("stdout forwarder can only be started once");
        let (tx, mut rx) = watch::channel(false);
        self.shutdown = Some(tx);

        self.worker = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => return,
                    token = outbox.recv() => match token {
                        None => return,
                        Some(token) => {
                            debug!("Received token from aggregator.");
                            println!("{}", String::from_utf8_lossy(&token));
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
        info!("Stopped stdout forwarder.");
    }
}

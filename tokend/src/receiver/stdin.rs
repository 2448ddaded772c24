// src/receiver/stdin.rs
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::pipeline::{Item, Receiver, STAGE_CHANNEL_CAPACITY};

/// A receiver that reads newline-delimited records from stdin and emits
/// each line as an opaque blob.
pub struct StdinReceiver {
    inbox_tx: mpsc::Sender<Item>,
    inbox_rx: Option<mpsc::Receiver<Item>>,
    shutdown: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

impl StdinReceiver {
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        Self {
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            shutdown: None,
            worker: None,
        }
    }
}

impl Default for StdinReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Receiver for StdinReceiver {
    fn set_config(&mut self, _config: &Config) {}

    fn take_inbox(&mut self) -> mpsc::Receiver<Item> {
        self.inbox_rx.take().expect("inbox can only be taken once")
    }

    async fn start(&mut self) -> Result<()> {
        let inbox = self.inbox_tx.clone();
        let (tx, mut rx) = watch::channel(false);
        self.shutdown = Some(tx);

        self.worker = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = rx.changed() => return,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if inbox.send(Item::Blob(line.into_bytes())).await.is_err() {
                                return;
                            }
                            debug!("Sent received data to aggregator.");
                        }
                        // EOF or a read error; either way we're done.
                        _ => return,
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
        info!("Stopped stdin receiver.");
    }
}

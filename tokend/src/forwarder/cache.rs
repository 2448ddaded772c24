// src/forwarder/cache.rs
// A token cache for the broker forwarder. A dedicated task owns the cached
// tokens and the age timestamp; all access is serialized through a command
// channel, so no locks are needed and `retrieve` is atomic with respect to
// the readiness check.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::tokenizer::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache not yet ready")]
    NotReady,
}

enum Command {
    Submit(Token),
    Len(oneshot::Sender<usize>),
    Age(oneshot::Sender<Option<Instant>>),
    IsReady(oneshot::Sender<bool>),
    Retrieve(oneshot::Sender<Result<Vec<Token>, CacheError>>),
}

pub struct TokenCache {
    commands: mpsc::Sender<Command>,
    worker: JoinHandle<()>,
}

impl TokenCache {
    /// Spawns the cache task. The cache is ready for retrieval once it
    /// holds more than `batch_size` tokens or its oldest token is older
    /// than `batch_period`, whichever comes first.
    pub fn start(batch_size: usize, batch_period: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel(1);
        let worker = tokio::spawn(async move {
            let mut elems: Vec<Token> = Vec::new();
            let mut age: Option<Instant> = None;

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Submit(token) => {
                        if elems.is_empty() {
                            age = Some(Instant::now());
                        }
                        elems.push(token);
                    }
                    Command::Len(reply) => {
                        let _ = reply.send(elems.len());
                    }
                    Command::Age(reply) => {
                        let _ = reply.send(age);
                    }
                    Command::IsReady(reply) => {
                        let _ = reply.send(is_ready(elems.len(), age, batch_size, batch_period));
                    }
                    Command::Retrieve(reply) => {
                        if is_ready(elems.len(), age, batch_size, batch_period) {
                            age = None;
                            let _ = reply.send(Ok(std::mem::take(&mut elems)));
                        } else {
                            let _ = reply.send(Err(CacheError::NotReady));
                        }
                    }
                }
            }
        });
        Self {
            commands: tx,
            worker,
        }
    }

    pub async fn submit(&self, token: Token) {
        let _ = self.commands.send(Command::Submit(token)).await;
    }

    pub async fn len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Len(tx)).await;
        rx.await.unwrap_or(0)
    }

    pub async fn age(&self) -> Option<Instant> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Age(tx)).await;
        rx.await.unwrap_or(None)
    }

    pub async fn is_ready(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::IsReady(tx)).await;
        rx.await.unwrap_or(false)
    }

    /// Drains the cache and resets its age. Fails unless the cache is
    /// ready; the check and the drain happen in one step inside the cache
    /// task.
    pub async fn retrieve(&self) -> Result<Vec<Token>, CacheError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Retrieve(tx)).await;
        rx.await.unwrap_or(Err(CacheError::NotReady))
    }

    pub async fn stop(self) {
        drop(self.commands);
        let _ = self.worker.await;
    }
}

fn is_ready(len: usize, age: Option<Instant>, batch_size: usize, batch_period: Duration) -> bool {
    match age {
        None => false,
        Some(age) => len > batch_size || age.elapsed() > batch_period,
    }
}

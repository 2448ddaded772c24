// src/pipeline.rs
// The pipeline has four conceptual stages. The receiver accepts incoming
// data and forwards it to the aggregator, which uses the tokenizer to turn
// data into tokens, which are then sent to the forwarder.
//
//   Receiver ──▶ Aggregator ──▶ Forwarder
//                    │
//                    ▼
//                Tokenizer
//
// Stages run as independent tasks and talk over bounded mpsc channels; each
// stage single-threads its own mutable state inside its worker task.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::tokenizer::{Token, Tokenize};

/// Capacity of the channels between stages. Keeping it at one means a
/// producer can be at most one item ahead of its consumer, so a slow
/// forwarder throttles request processing instead of growing a queue.
pub const STAGE_CHANNEL_CAPACITY: usize = 1;

/// A client's confirmation token request: the client's IP address and
/// wallet ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRequest {
    pub addr: IpAddr,
    pub wallet: Uuid,
}

/// What travels on the inbox channel. Receivers emit either typed client
/// requests or opaque blobs; the aggregator branches on the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Request(ClientRequest),
    Blob(Vec<u8>),
}

impl Item {
    /// The raw bytes a tokenizer operates on.
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            Item::Request(req) => ip_bytes(req.addr),
            Item::Blob(blob) => blob.clone(),
        }
    }
}

/// The network representation of an address: 4 bytes for IPv4, 16 for IPv6.
pub fn ip_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Receives input data from somewhere and emits it on the inbox channel.
#[async_trait]
pub trait Receiver: Send {
    fn set_config(&mut self, config: &Config);

    /// Hands out the consuming end of the inbox, to be connected to an
    /// aggregator. Can be taken once.
    fn take_inbox(&mut self) -> mpsc::Receiver<Item>;

    async fn start(&mut self) -> Result<()>;

    /// Shuts the stage down and waits for its worker to exit.
    async fn stop(&mut self);
}

/// Sits between the receiver and the forwarder and manages data while using
/// the tokenizer.
#[async_trait]
pub trait Aggregator: Send {
    fn set_config(&mut self, config: &Config);

    /// Attaches the tokenizer that must be used.
    fn use_tokenizer(&mut self, tokenizer: Arc<dyn Tokenize>);

    /// Binds the channel to read items from and the channel to send tokens
    /// to.
    fn connect(&mut self, inbox: mpsc::Receiver<Item>, outbox: mpsc::Sender<Token>);

    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self);
}

/// Sends tokens somewhere. Anywhere, really.
#[async_trait]
pub trait Forwarder: Send {
    fn set_config(&mut self, config: &Config);

    /// The sending end of the forwarder's input channel.
    fn outbox(&self) -> mpsc::Sender<Token>;

    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self);
}

// src/message.rs
// Data structures for the aggregator's per-epoch batch and for the messages
// we hand to the downstream sink.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Context, Result};
use apache_avro::types::Record as AvroRecord;
use apache_avro::Schema;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tokenizer::KeyId;

pub const SCHEMA_SERVICE: &str = "ADS";
pub const SCHEMA_SIGNAL: &str = "ANON_IP_ADDRS";

/// The Avro schema that the downstream sink expects. The schema is fixed;
/// failing to compile it is a startup error.
const SINK_SCHEMA: &str = r#"{
    "type": "record",
    "name": "DefaultMessage",
    "fields": [
        { "name": "wallet_id", "type": "string" },
        { "name": "service", "type": "string" },
        { "name": "signal", "type": "string" },
        { "name": "score", "type": "int" },
        { "name": "justification", "type": "string" },
        { "name": "created_at", "type": "string" }
    ]
}"#;

/// A set of string-encoded tokenized addresses.
pub type AddressSet = HashSet<String>;

/// Maps a wallet ID to the set of its tokenized addresses.
pub type AddrsByWallet = HashMap<Uuid, AddressSet>;

/// Tokens grouped by key epoch and wallet. Key IDs represent data collection
/// epochs: whenever the key rotates, new inserts land under a fresh outer
/// key while prior epochs remain until the next flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EpochBatch {
    wallets_by_key_id: HashMap<KeyId, AddrsByWallet>,
}

impl EpochBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tokenized address to the given wallet's set within the given
    /// epoch. Duplicates within an epoch are absorbed.
    pub fn insert(&mut self, key_id: KeyId, wallet: Uuid, addr: String) {
        self.wallets_by_key_id
            .entry(key_id)
            .or_default()
            .entry(wallet)
            .or_default()
            .insert(addr);
    }

    pub fn is_empty(&self) -> bool {
        self.wallets_by_key_id.is_empty()
    }

    /// Drains the batch, leaving it empty.
    pub fn take(&mut self) -> Self {
        Self {
            wallets_by_key_id: std::mem::take(&mut self.wallets_by_key_id),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyId, &AddrsByWallet)> {
        self.wallets_by_key_id.iter()
    }

    /// The number of wallets across all epochs. A wallet that shows up in
    /// two epochs counts twice.
    pub fn num_wallets(&self) -> usize {
        self.wallets_by_key_id.values().map(HashMap::len).sum()
    }

    /// The number of stored addresses across all epochs and wallets.
    pub fn num_addrs(&self) -> usize {
        self.wallets_by_key_id
            .values()
            .flat_map(HashMap::values)
            .map(HashSet::len)
            .sum()
    }
}

/// Returns the address set as a sorted vector, for deterministic output.
pub fn sorted_addrs(addrs: &AddressSet) -> Vec<String> {
    let mut v: Vec<String> = addrs.iter().cloned().collect();
    v.sort();
    v
}

/// The payload we embed in the sink message's justification field. We're
/// abusing that field by storing JSON in it; not elegant, but it lets the
/// sink ingest tokenized addresses without a schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Justification {
    pub keyid: KeyId,
    pub addrs: Vec<String>,
}

/// One downstream message, covering a single (epoch, wallet) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkMessage {
    pub wallet_id: String,
    pub service: String,
    pub signal: String,
    pub score: i32,
    pub justification: String,
    pub created_at: String,
}

/// Compiles the sink schema. Called once at bootstrap.
pub fn sink_schema() -> Result<Schema> {
    Schema::parse_str(SINK_SCHEMA).context("failed to compile Avro schema")
}

/// Builds the Avro-encoded sink message for one (epoch, wallet, addresses)
/// triple.
pub fn compile_sink_msg(
    schema: &Schema,
    key_id: KeyId,
    wallet: Uuid,
    addrs: &AddressSet,
) -> Result<Vec<u8>> {
    let justification = Justification {
        keyid: key_id,
        addrs: sorted_addrs(addrs),
    };
    let msg = SinkMessage {
        wallet_id: wallet.to_string(),
        service: SCHEMA_SERVICE.to_string(),
        signal: SCHEMA_SIGNAL.to_string(),
        score: 0,
        justification: serde_json::to_string(&justification)?,
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    avro_encode(schema, &msg)
}

/// Encodes the message as a raw Avro datum (no container framing).
pub fn avro_encode(schema: &Schema, msg: &SinkMessage) -> Result<Vec<u8>> {
    let mut record =
        AvroRecord::new(schema).ok_or_else(|| anyhow!("sink schema is not a record"))?;
    record.put("wallet_id", msg.wallet_id.as_str());
    record.put("service", msg.service.as_str());
    record.put("signal", msg.signal.as_str());
    record.put("score", msg.score);
    record.put("justification", msg.justification.as_str());
    record.put("created_at", msg.created_at.as_str());
    apache_avro::to_avro_datum(schema, record).context("failed to Avro-encode sink message")
}

/// Decodes a raw Avro datum back into a message.
pub fn avro_decode(schema: &Schema, datum: &[u8]) -> Result<SinkMessage> {
    let value = apache_avro::from_avro_datum(schema, &mut &datum[..], None)
        .context("failed to Avro-decode sink message")?;
    apache_avro::from_value::<SinkMessage>(&value).context("unexpected Avro record shape")
}

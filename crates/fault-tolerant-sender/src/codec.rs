//! Queue encoding for batches.
//!
//! Batches are stored as `{"datas": [...]}`. Numbers keep their literal
//! representation, so integers stay integers and large values keep their
//! precision.

use crate::{Batch, Record};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    datas: &'a [Record],
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    datas: Batch,
}

/// Serialize a batch for queue storage.
pub fn encode_batch(records: &[Record]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&EnvelopeRef { datas: records })
}

/// Deserialize a batch read back from a queue.
pub fn decode_batch(bytes: &[u8]) -> Result<Batch, serde_json::Error> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    Ok(envelope.datas)
}

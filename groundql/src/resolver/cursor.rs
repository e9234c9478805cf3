//! Opaque pagination cursors.
//!
//! A cursor names the last returned index key relative to the scanned
//! index, plus the collection and ordering it belongs to, so it cannot be
//! replayed against a different query shape.

use crate::error::ResolveError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    c: String,
    o: String,
    k: String,
}

pub fn encode(collection: &str, order: &str, key_suffix: &[u8]) -> String {
    let payload = Payload {
        c: collection.to_string(),
        o: order.to_string(),
        k: hex::encode(key_suffix),
    };
    // Serializing three strings cannot fail.
    let json = serde_json::to_vec(&payload).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// The key suffix stored in `cursor`, checked against the query it is used with.
pub fn decode(cursor: &str, collection: &str, order: &str) -> Result<Vec<u8>, ResolveError> {
    let invalid = |message: &str| ResolveError::InvalidCursor(message.to_string());
    let json = URL_SAFE_NO_PAD
        .decode(cursor.trim())
        .map_err(|_| invalid("not base64"))?;
    let payload: Payload = serde_json::from_slice(&json).map_err(|_| invalid("malformed payload"))?;
    if payload.c != collection {
        return Err(invalid(&format!(
            "cursor belongs to collection '{}', not '{collection}'",
            payload.c
        )));
    }
    if payload.o != order {
        return Err(invalid(&format!(
            "cursor was issued for ordering '{}', not '{order}'",
            payload.o
        )));
    }
    hex::decode(&payload.k).map_err(|_| invalid("malformed key"))
}

//! Synthetic entry ids.
//!
//! A synthetic id is `synth:` + the nearest persisted ancestor id + `:` +
//! base64 of the source-specific sub-path. Decoding splits on the last
//! delimiter, which the base64 alphabet never contains, so the parent id
//! itself may carry delimiters.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{CatalogError, Result};

pub const SYNTH_PREFIX: &str = "synth:";
pub const DELIMITER: char = ':';

pub fn is_synthetic(id: &str) -> bool {
    id.starts_with(SYNTH_PREFIX)
}

pub fn encode(parent_id: &str, sub_path: &str) -> String {
    let encoded_len = sub_path.len() * 4 / 3 + 4;
    let mut id = String::with_capacity(SYNTH_PREFIX.len() + parent_id.len() + 1 + encoded_len);
    id.push_str(SYNTH_PREFIX);
    id.push_str(parent_id);
    id.push(DELIMITER);
    id.push_str(&STANDARD.encode(sub_path.as_bytes()));
    id
}

/// Splits a synthetic id into `(parent_id, sub_path)`.
///
/// # Errors
///
/// `MalformedId` when the prefix or delimiter is absent, the parent id is
/// empty, or the payload is not base64-encoded UTF-8.
pub fn decode(id: &str) -> Result<(String, String)> {
    let rest = id
        .strip_prefix(SYNTH_PREFIX)
        .ok_or_else(|| CatalogError::malformed_id(id, "missing synthetic prefix"))?;
    let (parent, payload) = rest
        .rsplit_once(DELIMITER)
        .ok_or_else(|| CatalogError::malformed_id(id, "missing delimiter"))?;
    if parent.is_empty() {
        return Err(CatalogError::malformed_id(id, "empty parent id"));
    }
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| CatalogError::malformed_id(id, format!("bad payload: {e}")))?;
    let sub_path = String::from_utf8(bytes)
        .map_err(|e| CatalogError::malformed_id(id, format!("bad payload: {e}")))?;
    Ok((parent.to_string(), sub_path))
}

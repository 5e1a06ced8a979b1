//! Newline-delimited JSON document framing.
//!
//! One top-level JSON object per line. A logical document is never split
//! across two frames, and a frame never carries more than one document.

use crate::TransportError;

/// Encode a document as one wire frame (JSON followed by `\n`).
///
/// # Errors
///
/// Returns error if the document cannot be serialized.
pub fn encode_frame(doc: &serde_json::Value) -> Result<Vec<u8>, TransportError> {
    let mut frame = serde_json::to_vec(doc)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decode one received line into a top-level JSON object.
///
/// # Errors
///
/// Returns [`TransportError::Serialization`] for invalid JSON and
/// [`TransportError::Malformed`] for valid JSON that is not an object.
pub fn decode_frame(line: &str) -> Result<serde_json::Value, TransportError> {
    let doc: serde_json::Value = serde_json::from_str(line)?;
    if !doc.is_object() {
        return Err(TransportError::Malformed(format!(
            "top-level JSON value is not an object: {doc}"
        )));
    }
    Ok(doc)
}

//! Deterministic record identifiers.
//!
//! A record's `uuid` is the SHA-256 of its stable upstream ids joined with
//! `:`. Re-fetching the same upstream item always produces the same id,
//! which is what makes repeated writes upserts instead of duplicates.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

/// Hash the given upstream identifiers into a stable document id.
///
/// Each part is trimmed; an empty part is an error since it would let
/// distinct records collide.
pub fn stable_uuid(parts: &[&str]) -> Result<String> {
    if parts.is_empty() {
        bail!("cannot derive a record id from zero identifiers");
    }

    let mut trimmed = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        let p = part.trim();
        if p.is_empty() {
            bail!("identifier #{} is empty in {:?}", i, parts);
        }
        trimmed.push(p);
    }

    let mut hasher = Sha256::new();
    hasher.update(trimmed.join(":").as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_parts_same_id() {
        let a = stable_uuid(&["job-1", "pipe-1", "wf-1"]).unwrap();
        let b = stable_uuid(&[" job-1", "pipe-1 ", "wf-1"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn order_matters() {
        let a = stable_uuid(&["a", "b"]).unwrap();
        let b = stable_uuid(&["b", "a"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_parts_rejected() {
        assert!(stable_uuid(&[]).is_err());
        assert!(stable_uuid(&["a", "  "]).is_err());
    }
}

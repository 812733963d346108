use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, Result};

const SCHEME: &str = "ed2k://";
const HASH_BYTES: usize = 16;

/// A parsed `ed2k://|file|<name>|<size>|<hash>|/` link.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Ed2kLink {
    pub filename: String,
    pub size: i64,
    pub hash: String,
}

/// Canonical form of a content hash: trimmed lowercase hex.
pub fn normalize_hash(hash: &str) -> String {
    hash.trim().to_ascii_lowercase()
}

pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_BYTES * 2
        && hex::decode(hash)
            .map(|bytes| bytes.len() == HASH_BYTES)
            .unwrap_or(false)
}

pub fn parse_link(link: &str) -> Result<Ed2kLink> {
    let trimmed = link.trim();
    let scheme_matches = trimmed
        .get(..SCHEME.len())
        .map(|prefix| prefix.eq_ignore_ascii_case(SCHEME))
        .unwrap_or(false);
    if !scheme_matches {
        return Err(BridgeError::Parse(format!("not an ed2k link: {}", trimmed)));
    }

    let body = trimmed[SCHEME.len()..].trim_end_matches('/');
    let mut parts = body.split('|');
    if parts.next() != Some("") {
        return Err(BridgeError::Parse("ed2k link must start with '|'".to_string()));
    }
    match parts.next() {
        Some(kind) if kind.eq_ignore_ascii_case("file") => {}
        Some(kind) => {
            return Err(BridgeError::Parse(format!(
                "unsupported ed2k link type '{}'",
                kind
            )))
        }
        None => return Err(BridgeError::Parse("ed2k link has no type".to_string())),
    }

    let raw_name = parts
        .next()
        .ok_or_else(|| BridgeError::Parse("ed2k link has no file name".to_string()))?;
    let filename = urlencoding::decode(raw_name)
        .map_err(|err| BridgeError::Parse(format!("invalid file name encoding: {}", err)))?
        .trim()
        .to_string();
    if filename.is_empty() {
        return Err(BridgeError::Parse("ed2k link has an empty file name".to_string()));
    }

    let size = parts
        .next()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .filter(|size| *size >= 0)
        .ok_or_else(|| BridgeError::Parse("ed2k link has an invalid size".to_string()))?;

    let hash = parts
        .next()
        .map(normalize_hash)
        .filter(|hash| is_valid_hash(hash))
        .ok_or_else(|| BridgeError::Parse("ed2k link has an invalid hash".to_string()))?;

    Ok(Ed2kLink {
        filename,
        size,
        hash,
    })
}

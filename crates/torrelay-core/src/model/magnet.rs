//! Magnet URI parsing.

use url::Url;

use crate::error::{EngineError, EngineResult};

const BTIH_PREFIX: &str = "urn:btih:";

/// Metadata extracted from a magnet URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    /// Lowercased info hash (40 hex or 32 base32 characters).
    pub info_hash: String,
    /// Display name (`dn`), when present.
    pub display_name: Option<String>,
}

impl MagnetLink {
    /// Parse a magnet URI and extract its info hash and display name.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] when the URI is not a magnet or
    /// carries no valid `btih` topic.
    pub fn parse(uri: &str) -> EngineResult<Self> {
        let invalid = |reason: &'static str| EngineError::InvalidArgument {
            field: "magnet",
            reason,
            value: Some(uri.to_string()),
        };

        let url = Url::parse(uri.trim()).map_err(|_| invalid("unparsable"))?;
        if url.scheme() != "magnet" {
            return Err(invalid("scheme"));
        }

        let mut info_hash = None;
        let mut display_name = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let lowered = value.to_ascii_lowercase();
                    if let Some(hash) = lowered.strip_prefix(BTIH_PREFIX)
                        && is_valid_hash(hash)
                    {
                        info_hash = Some(hash.to_string());
                    }
                }
                "dn" if !value.trim().is_empty() => {
                    display_name = Some(value.trim().to_string());
                }
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| invalid("missing_btih"))?;
        Ok(Self {
            info_hash,
            display_name,
        })
    }
}

fn is_valid_hash(hash: &str) -> bool {
    match hash.len() {
        40 => hash.chars().all(|ch| ch.is_ascii_hexdigit()),
        32 => hash
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ('2'..='7').contains(&ch)),
        _ => false,
    }
}

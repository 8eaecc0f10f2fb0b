//! Identifier normalization shared by every stage.
//!
//! Condition IDs are stored as 64 lowercase hex characters without a `0x`
//! prefix. Addresses and transaction hashes keep the `0x` prefix and are
//! lowercased. Both sides of every join go through these functions.

use crate::model::DataQuality;
use ethers::types::U256;

pub const CONDITION_ID_HEX_LEN: usize = 64;
const TX_HASH_HEX_LEN: usize = 64;

fn strip_hex_prefix(raw: &str) -> &str {
    let mut s = raw.trim();
    while let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        s = rest;
    }
    s
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Canonical form of a condition ID. Idempotent; does not validate.
pub fn normalize_condition_id(raw: &str) -> String {
    strip_hex_prefix(raw).to_ascii_lowercase()
}

/// Normalize and validate a condition ID.
///
/// The all-zero ID is a sentinel written by upstream feeds for "unknown" and
/// is rejected separately from malformed input.
pub fn parse_condition_id(raw: &str) -> Result<String, DataQuality> {
    let id = normalize_condition_id(raw);
    if id.len() != CONDITION_ID_HEX_LEN || !is_hex(&id) {
        return Err(DataQuality::MalformedConditionId);
    }
    if id.bytes().all(|b| b == b'0') {
        return Err(DataQuality::SentinelConditionId);
    }
    Ok(id)
}

pub fn is_canonical_condition_id(id: &str) -> bool {
    matches!(parse_condition_id(id), Ok(ref n) if n == id)
}

/// `0x` + 40 lowercase hex characters.
pub fn normalize_address(raw: &str) -> String {
    format!("0x{}", strip_hex_prefix(raw).to_ascii_lowercase())
}

/// `0x` + 64 lowercase hex characters.
pub fn normalize_tx_hash(raw: &str) -> String {
    format!("0x{}", strip_hex_prefix(raw).to_ascii_lowercase())
}

pub fn is_valid_tx_hash(hash: &str) -> bool {
    let body = strip_hex_prefix(hash);
    body.len() == TX_HASH_HEX_LEN && is_hex(body)
}

/// ERC-1155 position ids are compared as decimal strings; feeds that
/// publish them as hex are converted.
pub fn normalize_token_id(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => U256::from_str_radix(hex, 16).ok()?,
        None => U256::from_dec_str(s).ok()?,
    };
    Some(value.to_string())
}

/// How a batch of identifiers is formatted. Mixed conventions inside one
/// upstream table point at a broken feed rather than missing data.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FormatProfile {
    pub prefixed: usize,
    pub unprefixed: usize,
    pub uppercase: usize,
}

impl FormatProfile {
    pub fn of<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut profile = FormatProfile::default();
        for id in ids {
            let id = id.trim();
            let body = match id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
                Some(body) => {
                    profile.prefixed += 1;
                    body
                }
                None => {
                    profile.unprefixed += 1;
                    id
                }
            };
            if body.bytes().any(|b| b.is_ascii_uppercase()) {
                profile.uppercase += 1;
            }
        }
        profile
    }

    pub fn is_mixed(&self) -> bool {
        self.prefixed > 0 && self.unprefixed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CID: &str = "e3b1bc389210504ebcb9cffe4b0ed06ccac50561e0f24abb6379984cec030f00";

    #[test]
    fn prefixed_mixed_case_matches_plain_lowercase() {
        let upper = format!("0x{}", CID.to_uppercase());
        assert_eq!(normalize_condition_id(&upper), CID);
        assert_eq!(normalize_condition_id(CID), CID);
    }

    #[test]
    fn normalization_is_idempotent() {
        let inputs = [
            CID.to_string(),
            format!("0X{}", CID),
            format!("0x0x{}", CID),
            " 0xAB ".into(),
        ];
        for raw in inputs {
            let once = normalize_condition_id(&raw);
            assert_eq!(normalize_condition_id(&once), once);
        }
    }

    #[test]
    fn sentinel_and_malformed_ids_are_rejected() {
        assert_eq!(parse_condition_id(&"0".repeat(64)), Err(DataQuality::SentinelConditionId));
        assert_eq!(parse_condition_id("0x1234"), Err(DataQuality::MalformedConditionId));
        assert_eq!(parse_condition_id(""), Err(DataQuality::MalformedConditionId));
        assert_eq!(parse_condition_id(&"g".repeat(64)), Err(DataQuality::MalformedConditionId));
        assert_eq!(parse_condition_id(&format!("0x{}", CID)).as_deref(), Ok(CID));
        assert!(is_canonical_condition_id(CID));
        assert!(!is_canonical_condition_id(&format!("0x{}", CID)));
    }

    #[test]
    fn addresses_and_hashes_keep_prefix() {
        assert_eq!(
            normalize_address("0xD59D03EEB0FD5979C702BA20BCC25DA2AE1D9723"),
            "0xd59d03eeb0fd5979c702ba20bcc25da2ae1d9723"
        );
        assert!(is_valid_tx_hash(&format!("0x{}", CID)));
        assert!(!is_valid_tx_hash("0xabc"));
    }

    #[test]
    fn token_ids_compare_as_decimal() {
        assert_eq!(normalize_token_id(" 255 ").as_deref(), Some("255"));
        assert_eq!(normalize_token_id("0xff").as_deref(), Some("255"));
        assert_eq!(normalize_token_id(""), None);
        assert_eq!(normalize_token_id("12ab"), None);
    }

    #[test]
    fn format_profile_flags_mixed_conventions() {
        let ids = [format!("0x{}", CID), CID.to_string(), CID.to_uppercase()];
        let profile = FormatProfile::of(ids.iter().map(String::as_str));
        assert!(profile.is_mixed());
        assert_eq!(profile.prefixed, 1);
        assert_eq!(profile.unprefixed, 2);
        assert_eq!(profile.uppercase, 1);
    }

    #[test]
    fn uppercase_at_the_start_of_a_bare_id_is_counted() {
        let bare = format!("AB{}", &CID[2..]);
        assert_eq!(FormatProfile::of([bare.as_str()]).uppercase, 1);
        assert_eq!(FormatProfile::of(["0Xab"]).uppercase, 0);
        assert_eq!(FormatProfile::of(["0xAb"]).uppercase, 1);
    }
}

use sha2::{Digest, Sha256};

use crate::strategies::types::Side;

/// Deterministic key for an order: same run, market, side and price (to four
/// decimals) always produce the same 32 hex characters.
pub fn idempotency_key(run_id: &str, market_id: &str, side: Side, price: f64) -> String {
    let raw = format!("{}|{}|{}|{:.4}", run_id, market_id, side.as_str(), price);
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(digest)[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let a = idempotency_key("run-1", "m-1", Side::Buy, 0.1);
        let b = idempotency_key("run-1", "m-1", Side::Buy, 0.10001);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_changes_with_each_component() {
        let base = idempotency_key("run-1", "m-1", Side::Buy, 0.10);
        assert_ne!(base, idempotency_key("run-2", "m-1", Side::Buy, 0.10));
        assert_ne!(base, idempotency_key("run-1", "m-2", Side::Buy, 0.10));
        assert_ne!(base, idempotency_key("run-1", "m-1", Side::Sell, 0.10));
        assert_ne!(base, idempotency_key("run-1", "m-1", Side::Buy, 0.11));
    }

    #[test]
    fn test_key_matches_sha256_prefix() {
        let expected = hex::encode(Sha256::digest(b"run-1|m-1|BUY|0.1000"));
        assert_eq!(idempotency_key("run-1", "m-1", Side::Buy, 0.1), expected[..32]);
    }
}

//! Task ids: a fixed-width base-36 millisecond timestamp followed by a random
//! base-36 suffix, so plain lexicographic order tracks creation order.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const TIMESTAMP_WIDTH: usize = 8;
pub const SUFFIX_WIDTH: usize = 11;

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn new_id() -> String {
    let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    id_at(millis, Uuid::new_v4().as_u128())
}

pub fn id_at(unix_millis: u64, entropy: u128) -> String {
    let mut id = to_base36(u128::from(unix_millis), TIMESTAMP_WIDTH);
    let suffix = to_base36(entropy, SUFFIX_WIDTH);
    id.push_str(&suffix[suffix.len() - SUFFIX_WIDTH..]);
    id
}

/// Creation time encoded in the id prefix.
pub fn created_at(id: &str) -> Option<DateTime<Utc>> {
    let prefix = id.get(..TIMESTAMP_WIDTH)?;
    let millis = i64::from_str_radix(prefix, 36).ok()?;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
}

fn to_base36(mut value: u128, width: usize) -> String {
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    while digits.len() < width {
        digits.push(b'0');
    }
    digits.reverse();
    digits.into_iter().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_fixed_width() {
        let id = new_id();
        assert_eq!(id.len(), TIMESTAMP_WIDTH + SUFFIX_WIDTH);
        assert!(is_valid_id(&id));
    }

    #[test]
    fn new_id_encodes_the_current_time() {
        let before = Utc::now().timestamp_millis();
        let id = new_id();
        let after = Utc::now().timestamp_millis();

        let encoded = created_at(&id).expect("decodable prefix").timestamp_millis();
        assert!((before..=after).contains(&encoded));
    }

    #[test]
    fn later_ids_sort_after_earlier_ones_regardless_of_suffix() {
        let earlier = id_at(1_700_000_000_000, u128::MAX);
        let later = id_at(1_700_000_001_000, 0);
        assert!(earlier < later);
    }

    #[test]
    fn small_timestamps_are_zero_padded() {
        let id = id_at(35, 1);
        assert_eq!(&id[..TIMESTAMP_WIDTH], "0000000z");
        assert_eq!(&id[TIMESTAMP_WIDTH..], "00000000001");
    }

    #[test]
    fn created_at_decodes_prefix() {
        let id = id_at(1_700_000_000_123, 42);
        let decoded = created_at(&id).expect("decodable prefix");
        assert_eq!(decoded.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn ids_with_path_characters_are_rejected() {
        assert!(!is_valid_id("../etc"));
        assert!(!is_valid_id("ABC"));
        assert!(!is_valid_id(""));
        assert!(is_valid_id("lz0k2a9q0000abc"));
    }
}

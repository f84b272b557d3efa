//! Fractional sort keys.
//!
//! Siblings are ordered by a base-62 string compared byte-wise. A new key can
//! always be generated strictly between two existing ones without renumbering
//! anything else, provided neither bound ends in the zero digit `'0'`. Keys
//! produced here never do.

use tracing::warn;

/// Base-62 digits in ascending byte order.
pub const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Midpoint digit (`'V'`), used for the first key in an empty list.
const MID: usize = 31;

/// Position of a base-62 digit. Bytes outside the alphabet sort as zero.
fn base62_index(c: u8) -> usize {
    BASE62.iter().position(|&b| b == c).unwrap_or(0)
}

/// Generate a key strictly between `a` and `b`.
///
/// `None` for `a` means "before everything", `None` for `b` means "after
/// everything". With both absent the result is `"V"`.
///
/// If `a >= b`, or either bound is not a valid key, there is no reliable
/// answer; the problem is logged and a key after `a` is returned, leaving
/// ties to the caller's id tie-break.
pub fn key_between(a: Option<&str>, b: Option<&str>) -> String {
    if !a.is_none_or(is_valid_key) || !b.is_none_or(is_valid_key) {
        warn!(lo = ?a, hi = ?b, "fractional bound is not a valid key, appending after lower bound");
        return key_after(a);
    }

    let lo = a.unwrap_or("").as_bytes();
    if let Some(hi) = b
        && lo >= hi.as_bytes()
    {
        warn!(lo = ?a, hi, "no fractional key between bounds, appending after lower bound");
        return key_after(a);
    }

    match midpoint(lo, b.map(str::as_bytes)) {
        Some(key) => key,
        None => {
            warn!(lo = ?a, hi = ?b, "fractional bounds have no room between them");
            key_after(a)
        }
    }
}

/// A key sorting after `a`, for bounds that cannot be split.
fn key_after(a: Option<&str>) -> String {
    let mid = char::from(BASE62[MID]);
    match a {
        Some(a) if is_valid_key(a) => {
            midpoint(a.as_bytes(), None).unwrap_or_else(|| format!("{a}{mid}"))
        }
        // Extending a string always sorts after it, whatever its bytes.
        Some(a) => format!("{a}{mid}"),
        None => mid.to_string(),
    }
}

/// Digit-wise midpoint. `hi == None` is an open upper bound.
///
/// Returns `None` when no key fits (e.g. `"a"` and `"a0"`).
fn midpoint(lo: &[u8], mut hi: Option<&[u8]>) -> Option<String> {
    let mut out = Vec::with_capacity(lo.len() + 1);
    let limit = lo.len().max(hi.map_or(0, <[u8]>::len)) + 1;

    for i in 0..=limit {
        let l = lo.get(i).map_or(0, |&c| base62_index(c));
        let h = match hi {
            Some(h) => h.get(i).map_or(0, |&c| base62_index(c)),
            None => BASE62.len(),
        };

        if l + 1 < h {
            out.push(BASE62[(l + h) / 2]);
            return String::from_utf8(out).ok();
        }
        if l == h {
            out.push(BASE62[l]);
            continue;
        }
        if l + 1 == h {
            // Take the lower digit; everything after it is below `hi`.
            out.push(BASE62[l]);
            hi = None;
            continue;
        }
        return None;
    }
    None
}

/// Whether `key` only uses base-62 digits and does not end in `'0'`.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.bytes().all(|c| BASE62.contains(&c))
        && !key.ends_with('0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_first_key() {
        assert_eq!(key_between(None, None), "V");
    }

    #[test]
    fn test_append_and_prepend() {
        let first = key_between(None, None);
        let after = key_between(Some(&first), None);
        let before = key_between(None, Some(&first));
        assert!(before < first);
        assert!(first < after);
        assert!(is_valid_key(&after));
        assert!(is_valid_key(&before));
    }

    #[test]
    fn test_between_adjacent_digits() {
        let key = key_between(Some("a"), Some("b"));
        assert!("a" < key.as_str() && key.as_str() < "b", "{key}");
        assert!(is_valid_key(&key));
    }

    #[test]
    fn test_between_prefix_keys() {
        let key = key_between(Some("a"), Some("a1"));
        assert!("a" < key.as_str() && key.as_str() < "a1", "{key}");
        assert!(is_valid_key(&key));
    }

    #[test]
    fn test_append_past_last_digit() {
        let key = key_between(Some("z"), None);
        assert!(key.as_str() > "z");
        assert!(is_valid_key(&key));
    }

    #[test]
    fn test_collision_falls_back_after_lower() {
        let key = key_between(Some("V"), Some("V"));
        assert!(key.as_str() > "V");
    }

    #[test]
    fn test_foreign_bound_falls_back_after_lower() {
        let key = key_between(Some("~"), None);
        assert!(key.as_str() > "~", "{key}");

        let key = key_between(Some("a-b"), Some("z"));
        assert!(key.as_str() > "a-b", "{key}");
    }

    #[test]
    fn test_random_insertions_stay_ordered() {
        let mut rng = rand::thread_rng();
        let mut keys: Vec<String> = vec![key_between(None, None)];

        for _ in 0..500 {
            let at = rng.gen_range(0..=keys.len());
            let lo = at.checked_sub(1).map(|i| keys[i].clone());
            let hi = keys.get(at).cloned();
            let key = key_between(lo.as_deref(), hi.as_deref());
            assert!(is_valid_key(&key), "{key}");
            if let Some(lo) = &lo {
                assert!(lo < &key, "{lo} !< {key}");
            }
            if let Some(hi) = &hi {
                assert!(&key < hi, "{key} !< {hi}");
            }
            keys.insert(at, key);
        }

        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(sorted, keys);
    }
}

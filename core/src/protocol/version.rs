//! Protocol version comparison.
//!
//! Versions are dot-separated integer components (`"1.0"`, `"2.1.3"`).
//! Comparison walks components left to right; missing components count
//! as zero, so `"1"` equals `"1.0"`. Non-numeric components also count
//! as zero.

use std::cmp::Ordering;

/// Compare two version strings component-wise.
pub fn compare(a: &str, b: &str) -> Ordering {
    let left: Vec<u64> = components(a);
    let right: Vec<u64> = components(b);
    let len = left.len().max(right.len());

    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Whether `version` is at least `minimum`.
pub fn is_at_least(version: &str, minimum: &str) -> bool {
    compare(version, minimum) != Ordering::Less
}

fn components(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_versions() {
        assert_eq!(compare("1.0", "1.0"), Ordering::Equal);
        assert_eq!(compare("1", "1.0"), Ordering::Equal);
        assert_eq!(compare("1.0.0", "1"), Ordering::Equal);
    }

    #[test]
    fn ordering_is_component_wise() {
        assert_eq!(compare("1.2", "1.10"), Ordering::Less);
        assert_eq!(compare("2.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare("0.9", "1.0"), Ordering::Less);
    }

    #[test]
    fn non_numeric_components_count_as_zero() {
        assert_eq!(compare("1.x", "1.0"), Ordering::Equal);
        assert_eq!(compare("x", "0"), Ordering::Equal);
    }

    #[test]
    fn is_at_least_boundary() {
        assert!(is_at_least("1.0", "1.0"));
        assert!(is_at_least("1.1", "1.0"));
        assert!(!is_at_least("0.9", "1.0"));
    }
}

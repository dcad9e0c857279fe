//! Big-endian byte arithmetic used by the nonce search

use std::cmp::Ordering;

/// Increment a big-endian number by one, carrying into higher bytes
pub fn inc(value: &mut [u8]) {
    inc_by(value, 1);
}

/// Increment a big-endian number by a single-byte amount, carrying into
/// higher bytes. Overflow of the whole number wraps around.
pub fn inc_by(value: &mut [u8], amount: u8) {
    let mut carry = amount as u16;
    for byte in value.iter_mut().rev() {
        if carry == 0 {
            break;
        }
        let sum = *byte as u16 + carry;
        *byte = sum as u8;
        carry = sum >> 8;
    }
}

/// Unsigned big-endian `a < b` for equally sized numbers
pub fn lt(a: &[u8], b: &[u8]) -> bool {
    debug_assert_eq!(a.len(), b.len());
    a.cmp(b) == Ordering::Less
}

/// Unsigned big-endian `a < b` considering only the leading `size` bytes
pub fn lt_bounded(a: &[u8], b: &[u8], size: usize) -> bool {
    a[..size].cmp(&b[..size]) == Ordering::Less
}

/// Left-pad with zero bytes up to `size`
pub fn expand(value: &[u8], size: usize) -> Vec<u8> {
    if value.len() >= size {
        return value.to_vec();
    }
    let mut out = vec![0u8; size - value.len()];
    out.extend_from_slice(value);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_expand() {
        assert_eq!(expand(&[1], 2), vec![0, 1]);
        assert_eq!(expand(&[1, 2, 3], 2), vec![1, 2, 3]);
    }

    #[test]
    fn test_increment_carry() {
        let mut value = [0u8, 255];
        inc(&mut value);
        assert_eq!(value, [1, 0]);

        let mut value = [0u8, 255, 255, 255];
        inc(&mut value);
        assert_eq!(value, [1, 0, 0, 0]);
    }

    #[test]
    fn test_increment_by_value() {
        for v in 0u16..256 {
            for i in 1u16..256 {
                let mut value = [0u8, v as u8];
                inc_by(&mut value, i as u8);
                assert_eq!(value, (v + i).to_be_bytes(), "value = {v}; inc = {i}");
            }
        }
    }

    #[test]
    fn test_increment_wraps_at_max() {
        let mut value = [255u8; 8];
        inc(&mut value);
        assert_eq!(value, [0u8; 8]);
    }

    #[test]
    fn test_lower_than_matches_integer_order() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let a: u64 = rng.gen::<u64>() >> rng.gen_range(0..64);
            let b: u64 = rng.gen::<u64>() >> rng.gen_range(0..64);
            assert_eq!(lt(&a.to_be_bytes(), &b.to_be_bytes()), a < b, "a = {a:x}, b = {b:x}");
        }
        assert!(!lt(&[1, 2], &[1, 2]));
    }

    #[test]
    fn test_lower_than_bounded() {
        let a = [0u8, 1, 9, 9];
        let b = [0u8, 2, 0, 0];
        assert!(lt_bounded(&a, &b, 2));
        assert!(!lt_bounded(&a, &b, 1));
        assert!(!lt_bounded(&b, &a, 4));
    }
}

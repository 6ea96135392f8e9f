//! Checked arithmetic for the sizes and offsets that flow through the
//! archive. Every addition of an offset and a length, and every narrowing
//! conversion of a `u64` coming off the wire, goes through here so an
//! overflow turns into `Error::SizeOverflow` instead of a silent wraparound
//! or a panic.

use crate::errors::Error;

pub fn checked_add(a: u64, b: u64, what: &str) -> Result<u64, Error> {
    a.checked_add(b)
        .ok_or_else(|| Error::SizeOverflow(format!("{what}: {a} + {b} overflows u64")))
}

pub fn checked_sum(values: impl IntoIterator<Item = u64>, what: &str) -> Result<u64, Error> {
    values
        .into_iter()
        .try_fold(0u64, |acc, v| acc.checked_add(v))
        .ok_or_else(|| Error::SizeOverflow(format!("{what}: sum overflows u64")))
}

pub fn u64_to_usize(v: u64, what: &str) -> Result<usize, Error> {
    usize::try_from(v).map_err(|_| Error::SizeOverflow(format!("{what}: {v} does not fit in usize")))
}

pub fn u64_to_i64(v: u64, what: &str) -> Result<i64, Error> {
    i64::try_from(v).map_err(|_| Error::SizeOverflow(format!("{what}: {v} does not fit in i64")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_overflow_is_reported() {
        assert!(checked_add(u64::MAX, 1, "test").is_err());
        assert_eq!(checked_add(1, 2, "test").unwrap(), 3);
    }

    #[test]
    fn sum_overflow_is_reported() {
        assert!(checked_sum([u64::MAX, 1], "test").is_err());
        assert_eq!(checked_sum([1, 2, 3], "test").unwrap(), 6);
    }

    #[test]
    fn narrowing_conversions() {
        assert!(u64_to_usize(u64::MAX, "test").is_ok() || usize::BITS < 64);
        assert!(u64_to_i64(u64::MAX, "test").is_err());
        assert_eq!(u64_to_i64(5, "test").unwrap(), 5);
    }
}

//! Human-readable formatting for addresses, sizes and ranges in log output.

use core::fmt;

/// Formats an address as uppercase hexadecimal with a `0x` prefix and `_` separators every
/// 4 digits.
///
/// # Examples
///
/// ```
/// use memtrack::HumanAddress;
///
/// assert_eq!(format!("{}", HumanAddress(0x0)), "0x0");
/// assert_eq!(format!("{}", HumanAddress(0x1000)), "0x1000");
/// assert_eq!(format!("{}", HumanAddress(0x2311_324F)), "0x2311_324F");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanAddress(pub u64);

impl fmt::Display for HumanAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = u64::BITS - self.0.leading_zeros();
        let nibbles = bits.div_ceil(4).max(1);

        f.write_str("0x")?;
        for i in (0..nibbles).rev() {
            write!(f, "{:X}", (self.0 >> (i * 4)) & 0xF)?;
            if i != 0 && i % 4 == 0 {
                f.write_str("_")?;
            }
        }
        Ok(())
    }
}

/// Formats a byte count with binary prefixes (`B`, `KiB`, `MiB`, ...).
///
/// Exact multiples print without a fraction; everything else gets up to two decimals.
///
/// ```
/// use memtrack::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(512)), "512B");
/// assert_eq!(format!("{}", HumanSize(4096)), "4KiB");
/// assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub u64);

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        let mut unit = 0;
        let mut scale = 1u64;
        while unit + 1 < UNITS.len() && self.0 / scale >= 1024 {
            scale <<= 10;
            unit += 1;
        }

        if self.0 % scale == 0 {
            return write!(f, "{}{}", self.0 / scale, UNITS[unit]);
        }

        let value = self.0 as f64 / scale as f64;
        if (value * 10.0) as u64 as f64 == value * 10.0 {
            write!(f, "{:.1}{}", value, UNITS[unit])
        } else {
            write!(f, "{:.2}{}", value, UNITS[unit])
        }
    }
}

/// Formats a half-open byte range as `[start..end) (size)`.
///
/// ```
/// use memtrack::HumanRange;
///
/// assert_eq!(format!("{}", HumanRange::new(0x1000, 0x2000)), "[0x1000..0x3000) (8KiB)");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HumanRange {
    pub address: u64,
    pub size: u64,
}

impl HumanRange {
    #[inline]
    pub const fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }
}

impl fmt::Display for HumanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..{}) ({})",
            HumanAddress(self.address),
            HumanAddress(self.address.saturating_add(self.size)),
            HumanSize(self.size)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_groups_digits() {
        assert_eq!(format!("{}", HumanAddress(0)), "0x0");
        assert_eq!(format!("{}", HumanAddress(0xF)), "0xF");
        assert_eq!(format!("{}", HumanAddress(0x1_0000)), "0x1_0000");
        assert_eq!(format!("{}", HumanAddress(0xDEAD_BEEF_CAFE)), "0xDEAD_BEEF_CAFE");
        assert_eq!(
            format!("{}", HumanAddress(u64::MAX)),
            "0xFFFF_FFFF_FFFF_FFFF"
        );
    }

    #[test]
    fn size_picks_unit() {
        assert_eq!(format!("{}", HumanSize(0)), "0B");
        assert_eq!(format!("{}", HumanSize(1023)), "1023B");
        assert_eq!(format!("{}", HumanSize(1024)), "1KiB");
        assert_eq!(format!("{}", HumanSize(0x1_0000)), "64KiB");
        assert_eq!(format!("{}", HumanSize(1 << 20)), "1MiB");
        assert_eq!(format!("{}", HumanSize(3 << 29)), "1.5GiB");
    }

    #[test]
    fn size_rounds_to_two_decimals() {
        assert_eq!(format!("{}", HumanSize(1025)), "1.00KiB");
        assert_eq!(format!("{}", HumanSize(1300)), "1.27KiB");
    }

    #[test]
    fn range_formats_bounds_and_size() {
        assert_eq!(
            format!("{}", HumanRange::new(0, 0x1000)),
            "[0x0..0x1000) (4KiB)"
        );
    }
}

//! Byte counts: constructors, parsing and display.

#[inline]
pub const fn kb(n: usize) -> usize {
    n << 10
}

#[inline]
pub const fn mb(n: usize) -> usize {
    n << 20
}

/// Parse a byte count with an optional `k`/`m`/`g` suffix.
pub fn parse_size(val: &str) -> Option<usize> {
    let val = val.trim();
    let (digits, shift) = match val.char_indices().last()? {
        (i, 'k' | 'K') => (&val[..i], 10),
        (i, 'm' | 'M') => (&val[..i], 20),
        (i, 'g' | 'G') => (&val[..i], 30),
        _ => (val, 0),
    };
    digits.trim_end().parse::<usize>().ok()?.checked_mul(1usize << shift)
}

/// Binary-unit rendering; exact multiples print without a fraction.
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut unit = 0;
    let mut scale = 1024usize;
    while unit + 1 < UNITS.len() && bytes / scale >= 1024 {
        unit += 1;
        scale <<= 10;
    }
    if bytes % scale == 0 {
        format!("{} {}", bytes / scale, UNITS[unit])
    } else {
        format!("{:.1} {}", bytes as f64 / scale as f64, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size(" 2k "), Some(kb(2)));
        assert_eq!(parse_size("3M"), Some(mb(3)));
        assert_eq!(parse_size("1g"), Some(1 << 30));
        assert_eq!(parse_size("ten"), None);
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("k"), None);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(160), "160 B");
        assert_eq!(format_bytes(kb(64)), "64 KiB");
        assert_eq!(format_bytes(mb(10)), "10 MiB");
        assert_eq!(format_bytes(1536), "1.5 KiB");
    }
}

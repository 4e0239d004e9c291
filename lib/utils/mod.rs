use crate::error::{Error, Result};

pub const FS_PAGE_SIZE: u64 = 4096;
pub const FS_ROOT_INODE: u64 = 1;

/// default upper bound of a single mapping created by `load`
pub const DEFAULT_CHUNK_SIZE: u64 = 256 << 20;

pub const fn align_up(size: u64, align: u64) -> u64 {
    (size + (align - 1)) & !(align - 1)
}

/// parse human readable size like `4GB`, `512MiB`, `64k` or a plain byte count, units are
/// binary (1K == 1024)
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    if num.is_empty() {
        return Err(Error::Config(format!("invalid size '{s}'")));
    }

    let shift = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        _ => return Err(Error::Config(format!("invalid size unit in '{s}'"))),
    };

    if let Ok(n) = num.parse::<u64>() {
        return n
            .checked_mul(1u64 << shift)
            .ok_or_else(|| Error::Config(format!("size '{s}' overflows")));
    }

    match num.parse::<f64>() {
        Ok(f) if f.is_finite() && f >= 0.0 => {
            let v = f * (1u64 << shift) as f64;
            if v > u64::MAX as f64 {
                return Err(Error::Config(format!("size '{s}' overflows")));
            }
            Ok(v as u64)
        }
        _ => Err(Error::Config(format!("invalid size '{s}'"))),
    }
}

/// render bytes the same way `parse_size` reads them
pub fn format_size(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut i = 0;
    let mut v = n as f64;
    while v >= 1024.0 && i < UNITS.len() - 1 {
        v /= 1024.0;
        i += 1;
    }
    if i == 0 {
        format!("{n}B")
    } else {
        format!("{v:.1}{}", UNITS[i])
    }
}

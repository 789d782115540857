//! Utility functions

/// transform bytes into a human readable format.
pub fn to_human_readable(n: u64) -> String {
    let mut n = n as f64;

    let units = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    let delimiter = 1000_f64;

    if n < delimiter {
        return format!("{n} B");
    }

    let mut u = 0;
    while (n * 10.0).round() / 10.0 >= delimiter && u < units.len() - 1 {
        n /= delimiter;
        u += 1;
    }

    format!("{:.2} {}", n, units[u])
}

/// Render a progress bar of `width` cells for `fraction` in 0..=1.
pub fn progress_bar(fraction: f64, width: usize) -> String {
    let fraction = fraction.clamp(0.0, 1.0);
    let filled = (fraction * width as f64) as usize;
    let mut bar = String::with_capacity(width * 3);
    bar.extend(std::iter::repeat('█').take(filled));
    bar.extend(std::iter::repeat('░').take(width - filled));
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn readable_size() {
        assert_eq!(to_human_readable(999), "999 B");
        assert_eq!(to_human_readable(483_740), "483.74 KB");
        assert_eq!(to_human_readable(28_780_000), "28.78 MB");
        assert_eq!(to_human_readable(1_950_000_000), "1.95 GB");
    }

    #[test]
    pub fn bar() {
        assert_eq!(progress_bar(0.0, 4), "░░░░");
        assert_eq!(progress_bar(0.5, 4), "██░░");
        assert_eq!(progress_bar(1.0, 4), "████");
        assert_eq!(progress_bar(7.0, 4), "████");
        assert_eq!(progress_bar(0.5, 40).chars().count(), 40);
    }
}

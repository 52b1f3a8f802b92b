const KILOBYTE: u64 = 1024;
const MEGABYTE: u64 = KILOBYTE * 1024;
const GIGABYTE: u64 = MEGABYTE * 1024;

/// Human readable size in binary steps, truncated: `512 B`, `7 KB`, `1 MB`.
pub fn format_file_size(bytes: u64) -> String {
    match bytes {
        b if b < KILOBYTE => format!("{} B", b),
        b if b < MEGABYTE => format!("{} KB", b / KILOBYTE),
        b if b < GIGABYTE => format!("{} MB", b / MEGABYTE),
        b => format!("{} GB", b / GIGABYTE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_largest_whole_unit() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(1023), "1023 B");
        assert_eq!(format_file_size(7 * 1024 + 100), "7 KB");
        assert_eq!(format_file_size(92 * 1024 * 1024), "92 MB");
        assert_eq!(format_file_size(3 * GIGABYTE + 1), "3 GB");
    }
}

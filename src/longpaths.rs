//! Extended-length path handling for Windows.
//!
//! Paths longer than [`SAFE_PATH_LENGTH`] UTF-16 code units must be opened
//! through the `\\?\` namespace. The transformation is applied exactly once,
//! when a path is registered (the transformed form is also the registry
//! key), and inverted exactly once, when a path is reported back to the
//! consumer.

use std::path::{Path, PathBuf};

/// Maximum number of UTF-16 code units a path may have before it needs the
/// extended-length prefix. Some directory-handling APIs cap out below
/// `MAX_PATH`, so this stays at 240 rather than 260.
const SAFE_PATH_LENGTH: usize = 240;

const LONG_PATH_PREFIX: &str = r"\\?\";
const UNC_LONG_PATH_PREFIX: &str = r"\\?\UNC\";

/// Converts a path to its extended-length form if it is too long to be used
/// directly. Short paths, already-prefixed paths and paths in an unknown
/// format are returned unchanged.
pub(crate) fn to_long_path(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    if raw.encode_utf16().count() <= SAFE_PATH_LENGTH || raw.starts_with(LONG_PATH_PREFIX) {
        return path.to_path_buf();
    }
    if is_drive_absolute(raw) {
        // C:\... -> \\?\C:\...
        PathBuf::from(format!("{LONG_PATH_PREFIX}{raw}"))
    } else if let Some(server_and_share) = raw.strip_prefix(r"\\") {
        // \\server\share\... -> \\?\UNC\server\share\...
        PathBuf::from(format!("{UNC_LONG_PATH_PREFIX}{server_and_share}"))
    } else {
        path.to_path_buf()
    }
}

/// Strips the extended-length prefix again for reporting, restoring the
/// `\\` lead-in for UNC paths.
pub(crate) fn from_long_path(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    if let Some(server_and_share) = raw.strip_prefix(UNC_LONG_PATH_PREFIX) {
        PathBuf::from(format!(r"\\{server_and_share}"))
    } else if let Some(rest) = raw.strip_prefix(LONG_PATH_PREFIX) {
        PathBuf::from(rest)
    } else {
        path.to_path_buf()
    }
}

fn is_drive_absolute(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'\\'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_local_path() -> String {
        format!(r"C:\{}", "a".repeat(300))
    }

    fn long_unc_path() -> String {
        format!(r"\\server\share\{}", "a".repeat(300))
    }

    #[test]
    fn short_paths_are_left_alone() {
        let path = Path::new(r"C:\short\path");
        assert_eq!(to_long_path(path), path);
    }

    #[test]
    fn long_local_paths_get_the_extended_prefix() {
        let raw = long_local_path();
        let long = to_long_path(Path::new(&raw));
        assert_eq!(long.to_str().unwrap(), format!(r"\\?\{raw}"));
    }

    #[test]
    fn long_unc_paths_get_the_unc_prefix() {
        let raw = long_unc_path();
        let long = to_long_path(Path::new(&raw));
        assert!(long
            .to_str()
            .unwrap()
            .starts_with(r"\\?\UNC\server\share\"));
    }

    #[test]
    fn already_prefixed_paths_are_left_alone() {
        let raw = format!(r"\\?\C:\{}", "a".repeat(300));
        assert_eq!(to_long_path(Path::new(&raw)), Path::new(&raw));
    }

    #[test]
    fn unknown_formats_are_left_alone() {
        let raw = "a".repeat(300);
        assert_eq!(to_long_path(Path::new(&raw)), Path::new(&raw));
    }

    #[test]
    fn length_threshold_counts_utf16_code_units() {
        // 121 two-unit code points put the path over the limit even though
        // it has fewer than 240 chars.
        let raw = format!(r"C:\{}", "\u{10000}".repeat(121));
        assert!(to_long_path(Path::new(&raw))
            .to_str()
            .unwrap()
            .starts_with(r"\\?\"));
    }

    #[test]
    fn reporting_round_trips_local_paths() {
        let raw = long_local_path();
        let path = PathBuf::from(&raw);
        assert_eq!(from_long_path(&to_long_path(&path)), path);
    }

    #[test]
    fn reporting_round_trips_unc_paths() {
        let raw = long_unc_path();
        let path = PathBuf::from(&raw);
        assert_eq!(from_long_path(&to_long_path(&path)), path);
    }

    #[test]
    fn unprefixed_paths_report_unchanged() {
        let path = Path::new(r"C:\plain");
        assert_eq!(from_long_path(path), path);
    }
}

//! Shared test utilities for the tabula crates.
//!
//! This crate provides common test helpers to reduce boilerplate across test modules:
//!
//! - [`TestDir`] - Managed temporary directory with table path helpers
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`capture_crash_image`] - Copy a live table directory as a crash would leave it
//! - [`strategies`] - Proptest generators for records and query operands

#![deny(unsafe_code)]
// Test utilities are allowed to use unwrap for simplicity
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod test_dir;
pub use test_dir::TestDir;

mod assertions;
pub use assertions::{assert_eventually, sorted_keys};

mod crash;
pub use crash::{capture_crash_image, corrupt_byte, truncate_file};

pub mod strategies;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use proptest::prelude::*;

    use super::*;

    // ============================================
    // TestDir tests
    // ============================================

    #[test]
    fn test_dir_creates_temp_directory() {
        let dir = TestDir::new();
        assert!(dir.path().exists(), "temp directory should exist");
        assert!(dir.path().is_dir(), "should be a directory");
    }

    #[test]
    fn test_dir_table_path_has_extension() {
        let dir = TestDir::new();
        let path = dir.table_path("casket");
        assert!(path.starts_with(dir.path()));
        assert!(path.ends_with("casket.tbl"));
    }

    #[test]
    fn test_dir_cleanup_on_drop() {
        let path = {
            let dir = TestDir::new();
            let p = dir.path().to_path_buf();
            std::fs::write(p.join("file.txt"), "data").expect("write file");
            assert!(p.exists());
            p
        };
        assert!(!path.exists(), "temp directory should be cleaned up on drop");
    }

    #[test]
    fn test_file_names_sorted() {
        let dir = TestDir::new();
        std::fs::write(dir.join("b"), "").unwrap();
        std::fs::write(dir.join("a"), "").unwrap();
        assert_eq!(dir.file_names(), vec!["a".to_string(), "b".to_string()]);
    }

    // ============================================
    // assert_eventually tests
    // ============================================

    #[test]
    fn test_assert_eventually_immediate_success() {
        assert!(assert_eventually(Duration::from_millis(100), || true));
    }

    #[test]
    fn test_assert_eventually_delayed_success() {
        let counter = AtomicUsize::new(0);
        let result = assert_eventually(Duration::from_millis(500), || {
            counter.fetch_add(1, Ordering::SeqCst) >= 3
        });
        assert!(result, "condition should eventually become true");
        assert!(counter.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn test_assert_eventually_timeout() {
        assert!(!assert_eventually(Duration::from_millis(30), || false));
    }

    #[test]
    fn test_sorted_keys() {
        assert_eq!(sorted_keys(["b", "a"]), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    // ============================================
    // Crash image tests
    // ============================================

    #[test]
    fn test_crash_image_copies_files() {
        let dir = TestDir::new();
        std::fs::write(dir.join("t.tbl"), b"main").unwrap();
        std::fs::write(dir.join("t.tbl.wal"), b"log").unwrap();
        std::fs::create_dir(dir.join("nested")).unwrap();

        let image = capture_crash_image(dir.path());
        assert_eq!(image.file_names(), vec!["t.tbl".to_string(), "t.tbl.wal".to_string()]);
        assert_eq!(std::fs::read(image.join("t.tbl")).unwrap(), b"main");
    }

    #[test]
    fn test_corrupt_and_truncate() {
        let dir = TestDir::new();
        let path = dir.join("f");
        std::fs::write(&path, [0u8, 1, 2, 3]).unwrap();
        corrupt_byte(&path, 1);
        assert_eq!(std::fs::read(&path).unwrap(), vec![0, 0xFE, 2, 3]);
        truncate_file(&path, 2);
        assert_eq!(std::fs::read(&path).unwrap().len(), 2);
    }

    proptest! {
        #[test]
        fn test_queryable_records_use_known_columns(record in strategies::arb_queryable_record()) {
            for column in record.keys() {
                prop_assert!(["age", "tags", "name"].contains(&column.as_str()));
            }
        }

        #[test]
        fn test_number_text_parses(text in strategies::arb_number_text()) {
            let text = String::from_utf8(text).unwrap();
            prop_assert!(text.parse::<f64>().is_ok());
        }
    }
}

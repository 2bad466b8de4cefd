//! Utility functions and helpers.
//!
//! - [`progress`] - Progress bars, usable as a collection progress tracker
//! - [`reader`] - File reader with automatic decompression and JSON parsing
//! - [`format`] - Number, duration and percentage formatting
//!
//! # Examples
//!
//! ```no_run
//! use aws_audit_tools::utils::reader::read_json;
//!
//! // .gz and .zst are decompressed transparently
//! let doc = read_json("ip-ranges.json.zst").unwrap();
//! ```

pub mod format;
pub mod progress;
pub mod reader;

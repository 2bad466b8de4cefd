//! Compressed-aware readers for range documents and quota exports.
//!
//! Provider range files are large JSON documents that are often mirrored
//! compressed. Anything ending in `.gz` or `.zst` is decompressed on the fly.
//!
//! # Examples
//!
//! ```no_run
//! use aws_audit_tools::utils::reader::read_json;
//!
//! let ranges = read_json("ip-ranges.json.gz").unwrap();
//! println!("sync token: {}", ranges["syncToken"]);
//! ```

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Open a file, decompressing by extension (`.gz`, `.zst`, otherwise plain).
pub fn open_file(path: impl AsRef<Path>) -> Result<Box<dyn Read + Send>> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;

    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "gz" => Ok(Box::new(GzDecoder::new(file))),
        "zst" => {
            let decoder = zstd::Decoder::new(file).with_context(|| {
                format!("Failed to create zstd decoder for: {}", path.display())
            })?;
            Ok(Box::new(decoder))
        }
        _ => Ok(Box::new(file)),
    }
}

/// Parse a whole JSON document from a plain or compressed file.
pub fn read_json(path: impl AsRef<Path>) -> Result<Value> {
    let path = path.as_ref();
    let reader = BufReader::new(open_file(path)?);
    serde_json::from_reader(reader)
        .with_context(|| format!("Failed to parse JSON from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const DOC: &str = r#"{"syncToken": "1700000000", "prefixes": [{"ip_prefix": "3.5.140.0/22"}]}"#;

    #[test]
    fn test_read_plain_json() {
        let mut temp = NamedTempFile::with_suffix(".json").unwrap();
        temp.write_all(DOC.as_bytes()).unwrap();
        temp.flush().unwrap();

        let value = read_json(temp.path()).unwrap();
        assert_eq!(value["syncToken"], "1700000000");
    }

    #[test]
    fn test_read_gzip_json() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut temp = NamedTempFile::with_suffix(".json.gz").unwrap();
        {
            let mut encoder = GzEncoder::new(&mut temp, Compression::default());
            encoder.write_all(DOC.as_bytes()).unwrap();
            encoder.finish().unwrap();
        }
        temp.flush().unwrap();

        let value = read_json(temp.path()).unwrap();
        assert_eq!(value["prefixes"][0]["ip_prefix"], "3.5.140.0/22");
    }

    #[test]
    fn test_read_zstd_json() {
        let mut temp = NamedTempFile::with_suffix(".json.zst").unwrap();
        {
            let mut encoder = zstd::Encoder::new(&mut temp, 3).unwrap();
            encoder.write_all(DOC.as_bytes()).unwrap();
            encoder.finish().unwrap();
        }
        temp.flush().unwrap();

        let value = read_json(temp.path()).unwrap();
        assert_eq!(value["prefixes"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_json_has_path_context() {
        let mut temp = NamedTempFile::with_suffix(".json").unwrap();
        temp.write_all(b"{not json").unwrap();
        temp.flush().unwrap();

        let err = read_json(temp.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse JSON"));
    }

    #[test]
    fn test_missing_file() {
        let err = open_file("/nonexistent/ranges.json").err().unwrap();
        assert!(err.to_string().contains("Failed to open file"));
    }
}

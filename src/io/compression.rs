//! Transparent decompression for log sources.
//!
//! Rotated sensor logs are often shipped compressed. [`open_decoded`] opens a
//! file and wraps it with the matching decoder so the rest of the pipeline
//! only ever sees plain NDJSON bytes.
//!
//! Detection checks the file extension first and falls back to magic bytes,
//! so a `.log` that is actually gzip-compressed still reads correctly.
//!
//! Built-in codecs (feature-gated):
//! - **Gzip** (`.gz`) via `flate2` (feature: `compression-gzip`)
//! - **Zstd** (`.zst`) via `zstd` (feature: `compression-zstd`)

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// A decompression codec for read paths.
pub trait CompressionCodec: Send + Sync {
    /// Human-readable codec name (e.g., "gzip").
    fn name(&self) -> &str;

    /// Lowercase file extensions including the leading dot.
    fn extensions(&self) -> &[&str];

    /// Magic byte signature, if the format has one.
    fn magic_bytes(&self) -> Option<&[u8]>;

    /// Wrap a reader with decompression.
    fn wrap_reader(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>>;
}

fn codecs() -> Vec<Box<dyn CompressionCodec>> {
    vec![
        #[cfg(feature = "compression-gzip")]
        Box::new(GzipCodec),
        #[cfg(feature = "compression-zstd")]
        Box::new(ZstdCodec),
    ]
}

fn detect_from_extension(path: &Path) -> Option<Box<dyn CompressionCodec>> {
    let path_str = path.to_string_lossy().to_lowercase();
    codecs()
        .into_iter()
        .find(|codec| codec.extensions().iter().any(|ext| path_str.ends_with(ext)))
}

/// Peek at the head of the stream without consuming it.
fn detect_from_magic<R: BufRead>(reader: &mut R) -> Option<Box<dyn CompressionCodec>> {
    let buf = reader.fill_buf().ok()?;
    if buf.is_empty() {
        return None;
    }
    codecs().into_iter().find(|codec| {
        codec
            .magic_bytes()
            .is_some_and(|magic| buf.len() >= magic.len() && buf.starts_with(magic))
    })
}

/// Wrap `reader` with a decoder if `path_hint` or the stream head says it is compressed.
///
/// # Errors
/// Returns an error if the decoder cannot be initialized.
pub fn auto_detect_reader<R: Read + 'static>(
    reader: R,
    path_hint: impl AsRef<Path>,
) -> Result<Box<dyn BufRead>> {
    if let Some(codec) = detect_from_extension(path_hint.as_ref()) {
        let inner = codec
            .wrap_reader(Box::new(reader))
            .with_context(|| format!("wrap reader with {} codec", codec.name()))?;
        return Ok(Box::new(BufReader::new(inner)));
    }

    let mut buf_reader = BufReader::new(reader);
    if let Some(codec) = detect_from_magic(&mut buf_reader) {
        let inner = codec
            .wrap_reader(Box::new(buf_reader))
            .with_context(|| format!("wrap reader with {} codec", codec.name()))?;
        return Ok(Box::new(BufReader::new(inner)));
    }

    Ok(Box::new(buf_reader))
}

/// Open `path` for line-oriented reading, decompressing when needed.
///
/// # Errors
/// Returns an error if the file cannot be opened or the decoder fails to start.
pub fn open_decoded(path: impl AsRef<Path>) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    auto_detect_reader(f, path).with_context(|| format!("setup decompression for {}", path.display()))
}

#[cfg(feature = "compression-gzip")]
struct GzipCodec;

#[cfg(feature = "compression-gzip")]
impl CompressionCodec for GzipCodec {
    fn name(&self) -> &str {
        "gzip"
    }

    fn extensions(&self) -> &[&str] {
        &[".gz", ".gzip"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x1f, 0x8b])
    }

    fn wrap_reader(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> {
        use flate2::read::MultiGzDecoder;
        Ok(Box::new(MultiGzDecoder::new(reader)))
    }
}

#[cfg(feature = "compression-zstd")]
struct ZstdCodec;

#[cfg(feature = "compression-zstd")]
impl CompressionCodec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn extensions(&self) -> &[&str] {
        &[".zst", ".zstd"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x28, 0xb5, 0x2f, 0xfd])
    }

    fn wrap_reader(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> {
        zstd::stream::read::Decoder::new(reader).map(|d| Box::new(d) as Box<dyn Read>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn plain_files_pass_through() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("plain.log");
        std::fs::write(&path, "a\nb\n").unwrap();
        let mut s = String::new();
        open_decoded(&path).unwrap().read_to_string(&mut s).unwrap();
        assert_eq!(s, "a\nb\n");
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn gzip_detected_by_magic_bytes() {
        use flate2::Compression;
        use flate2::write::GzEncoder;

        let tmp = tempfile::tempdir().unwrap();
        // No .gz extension: detection must fall back to the header.
        let path = tmp.path().join("rotated.log");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(b"{\"x\":1}\n").unwrap();
        enc.finish().unwrap();

        let mut s = String::new();
        open_decoded(&path).unwrap().read_to_string(&mut s).unwrap();
        assert_eq!(s, "{\"x\":1}\n");
    }

    #[cfg(feature = "compression-zstd")]
    #[test]
    fn zstd_detected_by_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lecturas.log.zst");
        let bytes = zstd::encode_all(&b"line\n"[..], 3).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let mut s = String::new();
        open_decoded(&path).unwrap().read_to_string(&mut s).unwrap();
        assert_eq!(s, "line\n");
    }
}

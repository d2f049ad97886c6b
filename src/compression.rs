//! Payload containers
//!
//! A payload is either a single raw file or an archive of a directory tree.
//! The archive is a tar stream written in canonical form (entries sorted by
//! path, zero timestamps and ids, fixed modes) so the same tree always
//! produces the same bytes and therefore the same content digest.
//!
//! ## Kinds
//!
//! - [`Compression::None`]: one raw file, copied as-is
//! - [`Compression::Zip`]: tar stream deflated with gzip
//! - [`Compression::Lz4`]: tar stream in an LZ4 frame; faster, larger
//!
//! ## Examples
//!
//! ```rust,no_run
//! use tessera::compression::CompressionEngine;
//! use tessera::types::Compression;
//! use std::path::Path;
//!
//! # fn main() -> tessera::Result<()> {
//! let mut engine = CompressionEngine::new(Compression::Zip);
//! engine.compress(Path::new("./site"), Path::new("./site.tgz"))?;
//! engine.decompress(Path::new("./site.tgz"), Path::new("./restored"))?;
//! println!("{:?}", engine.stats());
//! # Ok(())
//! # }
//! ```
//!
//! Extraction unpacks entry by entry with `tar::Entry::unpack_in`, which refuses
//! entries that would land outside the destination. Links are rejected.

use crate::error::{Result, TesseraError};
use crate::types::{Compression, SINGLE_FILE_NAME};
use crate::utils::relative_key;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::Instant;
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Statistics for one engine instance
#[derive(Debug, Default, Clone)]
pub struct CompressionStats {
    /// Payloads written
    pub payloads_compressed: usize,
    /// Payloads extracted
    pub payloads_decompressed: usize,
    /// Archive entries written (files and directories)
    pub entries_archived: usize,
    /// Bytes read from source trees
    pub bytes_in: u64,
    /// Bytes written to payload files
    pub bytes_out: u64,
    /// Total compression time in milliseconds
    pub compression_time_ms: u64,
    /// Total decompression time in milliseconds
    pub decompression_time_ms: u64,
}

impl CompressionStats {
    /// Output size relative to input size, 1.0 when nothing was written
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            return 1.0;
        }
        self.bytes_out as f64 / self.bytes_in as f64
    }
}

/// Writes and reads payload containers of one kind
#[derive(Debug)]
pub struct CompressionEngine {
    kind: Compression,
    stats: CompressionStats,
}

impl CompressionEngine {
    /// Create an engine for `kind`
    pub fn new(kind: Compression) -> Self {
        Self {
            kind,
            stats: CompressionStats::default(),
        }
    }

    /// Container kind this engine handles
    pub fn kind(&self) -> Compression {
        self.kind
    }

    /// Get current compression statistics
    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    /// Write `source` into the payload file `dest`
    ///
    /// `None` requires `source` to be a regular file. Archive kinds require a
    /// directory; the archive holds its contents, not the directory itself.
    /// Returns the payload size in bytes.
    pub fn compress(&mut self, source: &Path, dest: &Path) -> Result<u64> {
        let start = Instant::now();
        match self.kind {
            Compression::None => {
                if !source.is_file() {
                    return Err(TesseraError::validation(format!(
                        "{:?} is not a single file; choose a compression kind",
                        source
                    )));
                }
                fs::copy(source, dest)?;
                self.stats.bytes_in += fs::metadata(source)?.len();
            }
            Compression::Zip => {
                let encoder = GzEncoder::new(create_output(dest)?, flate2::Compression::default());
                let encoder = self.write_archive(source, encoder)?;
                encoder.finish()?.flush()?;
            }
            Compression::Lz4 => {
                let encoder = lz4_flex::frame::FrameEncoder::new(create_output(dest)?);
                let encoder = self.write_archive(source, encoder)?;
                encoder
                    .finish()
                    .map_err(|e| TesseraError::compression(e.to_string()))?
                    .flush()?;
            }
        }

        let size = fs::metadata(dest)?.len();
        self.stats.payloads_compressed += 1;
        self.stats.bytes_out += size;
        self.stats.compression_time_ms += start.elapsed().as_millis() as u64;
        debug!("Wrote {} payload {:?} ({} bytes)", self.kind, dest, size);
        Ok(size)
    }

    /// Extract the payload file `source` into the directory `dest`
    ///
    /// A `None` payload is placed at `dest/<file_name>`.
    pub fn decompress_as(&mut self, source: &Path, dest: &Path, file_name: &str) -> Result<()> {
        let start = Instant::now();
        fs::create_dir_all(dest)?;
        match self.kind {
            Compression::None => {
                fs::copy(source, dest.join(file_name))?;
            }
            Compression::Zip => {
                let decoder = GzDecoder::new(BufReader::new(File::open(source)?));
                unpack(decoder, dest)?;
            }
            Compression::Lz4 => {
                let decoder = lz4_flex::frame::FrameDecoder::new(BufReader::new(File::open(source)?));
                unpack(decoder, dest)?;
            }
        }
        self.stats.payloads_decompressed += 1;
        self.stats.decompression_time_ms += start.elapsed().as_millis() as u64;
        trace!("Extracted {:?} into {:?}", source, dest);
        Ok(())
    }

    /// Extract the payload file `source` into the directory `dest`
    pub fn decompress(&mut self, source: &Path, dest: &Path) -> Result<()> {
        self.decompress_as(source, dest, SINGLE_FILE_NAME)
    }

    /// Append `root`'s tree in canonical order and return the inner writer
    fn write_archive<W: Write>(&mut self, root: &Path, writer: W) -> Result<W> {
        if !root.is_dir() {
            return Err(TesseraError::validation(format!("{:?} is not a directory", root)));
        }
        let mut builder = Builder::new(writer);
        builder.follow_symlinks(false);

        let mut entries = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry = entry?;
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            entries.push((relative_key(relative)?, entry));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, entry) in entries {
            let file_type = entry.file_type();
            let mut header = Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            if file_type.is_dir() {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, Path::new(&key), std::io::empty())?;
            } else if file_type.is_file() {
                let len = entry.metadata()?.len();
                header.set_entry_type(EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(len);
                builder.append_data(&mut header, Path::new(&key), File::open(entry.path())?)?;
                self.stats.bytes_in += len;
            } else {
                trace!("Skipping non-regular entry {:?}", entry.path());
                continue;
            }
            self.stats.entries_archived += 1;
        }

        Ok(builder.into_inner()?)
    }
}

fn create_output(dest: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(dest)?))
}

fn unpack<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive.set_preserve_mtime(false);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        if !matches!(entry_type, EntryType::Regular | EntryType::Directory) {
            return Err(TesseraError::compression(format!(
                "unsupported archive entry type {:?}",
                entry_type
            )));
        }
        if !entry.unpack_in(dest)? {
            return Err(TesseraError::compression(format!(
                "archive entry {:?} escapes the destination",
                entry.path()?
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::TreeDigest;
    use tempfile::TempDir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("css")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("index.html"), "<h1>hello</h1>\n".repeat(50)).unwrap();
        fs::write(root.join("css/site.css"), b"body { margin: 0 }").unwrap();
    }

    #[test]
    fn test_archive_roundtrip_all_kinds() {
        for kind in [Compression::Zip, Compression::Lz4] {
            let temp = TempDir::new().unwrap();
            let src = temp.path().join("src");
            sample_tree(&src);

            let mut engine = CompressionEngine::new(kind);
            let payload = temp.path().join("payload");
            engine.compress(&src, &payload).unwrap();

            let out = temp.path().join("out");
            engine.decompress(&payload, &out).unwrap();
            assert_eq!(
                TreeDigest::compute(&src).unwrap(),
                TreeDigest::compute(&out).unwrap(),
                "{kind}"
            );
            assert!(out.join("empty").is_dir());
            assert_eq!(engine.stats().payloads_compressed, 1);
            assert_eq!(engine.stats().payloads_decompressed, 1);
        }
    }

    #[test]
    fn test_archive_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        sample_tree(&src);

        let mut engine = CompressionEngine::new(Compression::Zip);
        engine.compress(&src, &temp.path().join("a")).unwrap();
        // Touching mtimes must not change the payload bytes
        fs::write(src.join("css/site.css"), b"body { margin: 0 }").unwrap();
        engine.compress(&src, &temp.path().join("b")).unwrap();

        assert_eq!(
            fs::read(temp.path().join("a")).unwrap(),
            fs::read(temp.path().join("b")).unwrap()
        );
    }

    #[test]
    fn test_none_requires_single_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        sample_tree(&src);

        let mut engine = CompressionEngine::new(Compression::None);
        assert!(engine.compress(&src, &temp.path().join("payload")).is_err());

        let payload = temp.path().join("payload");
        engine.compress(&src.join("index.html"), &payload).unwrap();
        let out = temp.path().join("out");
        engine.decompress(&payload, &out).unwrap();
        assert_eq!(
            fs::read(out.join(SINGLE_FILE_NAME)).unwrap(),
            fs::read(src.join("index.html")).unwrap()
        );
    }

    #[test]
    fn test_corrupt_archive_fails() {
        let temp = TempDir::new().unwrap();
        let payload = temp.path().join("payload");
        fs::write(&payload, b"definitely not gzip").unwrap();

        let mut engine = CompressionEngine::new(Compression::Zip);
        assert!(engine.decompress(&payload, &temp.path().join("out")).is_err());
    }
}

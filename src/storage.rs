//! Content-addressed file and chunk storage
//!
//! Every payload file and every chunk lives in the data root under the hex
//! SHA-256 digest of its bytes, sharded two levels deep so no directory grows
//! unbounded:
//!
//! ```text
//! data_root/
//! └── 3f/
//!     └── a9/
//!         └── 3fa9c0...e1        # one file per digest
//! temp_root/
//! └── join/                      # interim joined files
//! ```
//!
//! A [`ContentFile`] is a handle to one digest. It may refer to bytes that are
//! not present yet (a reference learned from a transaction), and may carry the
//! ordered list of chunks whose concatenation is the whole file.
//!
//! ## Roles
//!
//! Whole files and chunks share one type. The [`FileRole`] discriminant picks
//! the size bound used by [`ContentFile::validate`]: chunks are held to the
//! stricter per-chunk maximum.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tessera::storage::ContentStore;
//!
//! # fn main() -> tessera::Result<()> {
//! let store = ContentStore::new("./data", "./temp", 500 * 1024 * 1024, 1024 * 1024);
//! let mut file = store.store(b"hello world")?;
//! file.split(4)?;
//! assert_eq!(file.chunks().len(), 3);
//!
//! // Later, on another node that only knows the digests
//! let mut remote = store.reference_with_chunks(file.digest(), &file.chunk_hashes().unwrap())?;
//! remote.delete()?;
//! remote.join()?;
//! assert!(remote.is_valid()?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Deletion safety
//!
//! Nothing is ever deleted unless its path resolves strictly underneath the
//! data or temp root. Emptied shard directories are pruned afterwards.

use crate::error::{Result, TesseraError};
use crate::utils::{self, hash_file_content};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Whether a content file is a whole payload or one chunk of it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileRole {
    /// Complete payload, bounded by the whole-file maximum
    Whole,
    /// One window of a payload, bounded by the chunk maximum
    Chunk,
}

/// Outcome of a size validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationResult {
    /// Present and within bounds
    Ok,
    /// Larger than the bound for its role
    FileTooLarge,
    /// Not present on disk
    FileNotFound,
}

#[derive(Debug)]
struct StoreRoots {
    data: PathBuf,
    temp: PathBuf,
    max_file_size: u64,
    max_chunk_size: u64,
}

/// Sharded content-addressed store rooted at a data directory
///
/// Cheap to clone; clones share the same roots.
#[derive(Debug, Clone)]
pub struct ContentStore {
    roots: Arc<StoreRoots>,
}

impl ContentStore {
    /// Create a store handle. Directories are created lazily on first write.
    pub fn new(
        data_root: impl Into<PathBuf>,
        temp_root: impl Into<PathBuf>,
        max_file_size: u64,
        max_chunk_size: u64,
    ) -> Self {
        Self {
            roots: Arc::new(StoreRoots {
                data: data_root.into(),
                temp: temp_root.into(),
                max_file_size,
                max_chunk_size,
            }),
        }
    }

    /// Root holding content files
    pub fn data_root(&self) -> &Path {
        &self.roots.data
    }

    /// Root holding working trees
    pub fn temp_root(&self) -> &Path {
        &self.roots.temp
    }

    /// Upper bound for a file in the given role
    pub fn max_size(&self, role: FileRole) -> u64 {
        match role {
            FileRole::Whole => self.roots.max_file_size,
            FileRole::Chunk => self.roots.max_chunk_size,
        }
    }

    /// Sharded location of a digest: `data/ab/cd/abcd...`
    pub fn path_for(&self, digest: &str) -> Result<PathBuf> {
        validate_digest(digest)?;
        Ok(self
            .roots
            .data
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(digest))
    }

    /// Lazy handle to a digest. No I/O is performed.
    pub fn reference(&self, digest: &str) -> Result<ContentFile> {
        self.handle(digest, FileRole::Whole)
    }

    /// Lazy handle to a digest together with its ordered chunk digests
    pub fn reference_with_chunks(&self, digest: &str, chunk_digests: &[String]) -> Result<ContentFile> {
        let mut file = self.reference(digest)?;
        file.chunks = chunk_digests
            .iter()
            .map(|d| self.handle(d, FileRole::Chunk))
            .collect::<Result<_>>()?;
        Ok(file)
    }

    /// Store bytes as a whole file
    pub fn store(&self, bytes: &[u8]) -> Result<ContentFile> {
        self.store_with_role(bytes, FileRole::Whole)
    }

    /// Store bytes as a chunk
    pub fn store_chunk(&self, bytes: &[u8]) -> Result<ContentFile> {
        self.store_with_role(bytes, FileRole::Chunk)
    }

    /// Copy an existing file into the store under its digest
    pub fn import_file(&self, source: &Path) -> Result<ContentFile> {
        let size = fs::metadata(source)?.len();
        let limit = self.max_size(FileRole::Whole);
        if size > limit {
            return Err(TesseraError::FileTooLarge {
                path: source.to_path_buf(),
                size,
                limit,
            });
        }
        let digest = hash_file_content(source)?;
        let file = self.handle(&digest, FileRole::Whole)?;
        if !file.exists() {
            utils::atomic_copy(source, &file.path)?;
        }
        file.verify_or_delete()?;
        trace!("Imported {:?} as {}", source, digest);
        Ok(file)
    }

    fn store_with_role(&self, bytes: &[u8], role: FileRole) -> Result<ContentFile> {
        let limit = self.max_size(role);
        if bytes.len() as u64 > limit {
            return Err(TesseraError::FileTooLarge {
                path: PathBuf::new(),
                size: bytes.len() as u64,
                limit,
            });
        }
        let digest = utils::hash_data(bytes);
        let file = self.handle(&digest, role)?;
        if !file.exists() {
            utils::atomic_write(&file.path, bytes)?;
        }
        file.verify_or_delete()?;
        trace!("Stored {} ({} bytes)", digest, bytes.len());
        Ok(file)
    }

    fn handle(&self, digest: &str, role: FileRole) -> Result<ContentFile> {
        Ok(ContentFile {
            path: self.path_for(digest)?,
            digest: digest.to_string(),
            role,
            chunks: Vec::new(),
            secret: None,
            store: self.clone(),
        })
    }

    fn roots(&self) -> [&Path; 2] {
        [&self.roots.data, &self.roots.temp]
    }
}

/// Digests are lowercase hex and at least long enough to shard
fn validate_digest(digest: &str) -> Result<()> {
    if digest.len() < 8 || !digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(TesseraError::validation(format!("invalid content digest {digest:?}")));
    }
    Ok(())
}

/// Handle to one content-addressed file
#[derive(Clone)]
pub struct ContentFile {
    digest: String,
    role: FileRole,
    path: PathBuf,
    chunks: Vec<ContentFile>,
    secret: Option<Vec<u8>>,
    store: ContentStore,
}

impl std::fmt::Debug for ContentFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentFile")
            .field("digest", &self.digest)
            .field("role", &self.role)
            .field("chunks", &self.chunks.len())
            .field("has_secret", &self.secret.is_some())
            .finish()
    }
}

impl ContentFile {
    /// Hex digest
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Whole file or chunk
    pub fn role(&self) -> FileRole {
        self.role
    }

    /// Location in the data root
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ordered chunks
    pub fn chunks(&self) -> &[ContentFile] {
        &self.chunks
    }

    /// Symmetric key for the unencrypted form, if known
    pub fn secret(&self) -> Option<&[u8]> {
        self.secret.as_deref()
    }

    /// Attach the symmetric key
    pub fn set_secret(&mut self, secret: Vec<u8>) {
        self.secret = Some(secret);
    }

    /// Whether the complete file is present
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Size on disk
    pub fn size(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TesseraError::missing(&self.digest))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check presence and the size bound for this file's role
    pub fn validate(&self) -> Result<ValidationResult> {
        let size = match self.size() {
            Ok(size) => size,
            Err(e) if e.is_missing_data() => return Ok(ValidationResult::FileNotFound),
            Err(e) => return Err(e),
        };
        if size > self.store.max_size(self.role) {
            return Ok(ValidationResult::FileTooLarge);
        }
        Ok(ValidationResult::Ok)
    }

    /// Validate and turn anything but `Ok` into an error
    pub fn validate_file_size(&self) -> Result<()> {
        match self.validate()? {
            ValidationResult::Ok => Ok(()),
            ValidationResult::FileNotFound => Err(TesseraError::missing(&self.digest)),
            ValidationResult::FileTooLarge => Err(TesseraError::FileTooLarge {
                path: self.path.clone(),
                size: self.size()?,
                limit: self.store.max_size(self.role),
            }),
        }
    }

    /// Whether the bytes on disk hash to this file's digest
    pub fn is_valid(&self) -> Result<bool> {
        if !self.exists() {
            return Ok(false);
        }
        Ok(hash_file_content(&self.path)? == self.digest)
    }

    /// Fail with an integrity error, deleting the file, if it does not hash to its digest
    pub fn verify_or_delete(&self) -> Result<()> {
        if !self.exists() {
            return Err(TesseraError::missing(&self.digest));
        }
        let actual = hash_file_content(&self.path)?;
        if actual != self.digest {
            warn!("Digest mismatch for {}: found {}", self.digest, actual);
            self.delete()?;
            return Err(TesseraError::HashMismatch {
                expected: self.digest.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Split the file into chunks of `chunk_size` bytes
    ///
    /// Reads the file sequentially. Each window is stored and validated as a
    /// chunk. On failure every chunk this call created is deleted again.
    /// Returns the number of chunks.
    pub fn split(&mut self, chunk_size: usize) -> Result<usize> {
        if chunk_size == 0 || chunk_size as u64 > self.store.max_size(FileRole::Chunk) {
            return Err(TesseraError::validation(format!(
                "chunk size {} outside 1..={}",
                chunk_size,
                self.store.max_size(FileRole::Chunk)
            )));
        }
        let mut reader = File::open(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TesseraError::missing(&self.digest),
            _ => e.into(),
        })?;

        let mut chunks = Vec::new();
        let mut created = Vec::new();
        let mut buffer = vec![0u8; chunk_size];
        let result = (|| -> Result<()> {
            loop {
                let filled = read_window(&mut reader, &mut buffer)?;
                if filled == 0 {
                    break;
                }
                let window = &buffer[..filled];
                let existed = self.store.path_for(&utils::hash_data(window))?.exists();
                let chunk = self.store.store_chunk(window)?;
                if !existed {
                    created.push(chunk.clone());
                }
                chunk.validate_file_size()?;
                chunks.push(chunk);
            }
            Ok(())
        })();

        if let Err(e) = result {
            for chunk in &created {
                if let Err(cleanup) = chunk.delete() {
                    warn!("Failed to remove chunk {}: {}", chunk.digest, cleanup);
                }
            }
            return Err(e);
        }

        debug!("Split {} into {} chunk(s)", self.digest, chunks.len());
        self.chunks = chunks;
        Ok(self.chunks.len())
    }

    /// Rebuild the whole file from its chunks
    ///
    /// Each chunk is checked against its own digest first; corrupt chunks are
    /// deleted and reported as missing so they can be fetched again. Chunks
    /// are then concatenated in order into `temp/join/<first chunk digest>.*`,
    /// the result is checked against this file's digest, and only then moved
    /// into the data root. A mismatch deletes the interim file and fails.
    pub fn join(&mut self) -> Result<()> {
        let first = self
            .chunks
            .first()
            .ok_or_else(|| TesseraError::validation(format!("{} has no chunks to join", self.digest)))?;
        let missing = self.missing_hashes();
        if !missing.is_empty() {
            return Err(TesseraError::MissingData(missing));
        }
        let mut corrupt = Vec::new();
        for chunk in &self.chunks {
            match chunk.verify_or_delete() {
                Ok(()) => {}
                Err(TesseraError::HashMismatch { .. }) => corrupt.push(chunk.digest.clone()),
                Err(e) => return Err(e),
            }
        }
        if !corrupt.is_empty() {
            return Err(TesseraError::MissingData(corrupt));
        }

        let join_dir = self.store.temp_root().join("join");
        fs::create_dir_all(&join_dir)?;
        let mut interim = tempfile::Builder::new()
            .prefix(&format!("{}.", first.digest))
            .tempfile_in(&join_dir)?;
        for chunk in &self.chunks {
            let mut source = File::open(&chunk.path)?;
            std::io::copy(&mut source, interim.as_file_mut())?;
        }
        interim.as_file_mut().flush()?;

        let actual = hash_file_content(interim.path())?;
        if actual != self.digest {
            return Err(TesseraError::HashMismatch {
                expected: self.digest.clone(),
                actual,
            });
        }
        utils::atomic_copy(interim.path(), &self.path)?;
        debug!("Joined {} chunk(s) into {}", self.chunks.len(), self.digest);
        Ok(())
    }

    /// Ordered chunk digests, or `None` when no real chunking happened
    ///
    /// A file that fits in a single chunk splits into exactly one chunk whose
    /// digest equals its own; that case reports `None`.
    pub fn chunk_hashes(&self) -> Option<Vec<String>> {
        match self.chunks.as_slice() {
            [] => None,
            [only] if only.digest == self.digest => None,
            chunks => Some(chunks.iter().map(|c| c.digest.clone()).collect()),
        }
    }

    /// Number of declared chunks
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of declared chunks present locally
    pub fn local_chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.exists()).count()
    }

    /// Whether every declared chunk is present
    pub fn all_chunks_exist(&self) -> bool {
        self.chunks.iter().all(ContentFile::exists)
    }

    /// Digests that must be fetched before this file can be read
    pub fn missing_hashes(&self) -> Vec<String> {
        if self.chunks.is_empty() {
            return if self.exists() { Vec::new() } else { vec![self.digest.clone()] };
        }
        self.chunks
            .iter()
            .filter(|c| !c.exists())
            .map(|c| c.digest.clone())
            .collect()
    }

    /// Whether the whole file is present or can be joined
    pub fn is_complete(&self) -> bool {
        self.exists() || (!self.chunks.is_empty() && self.all_chunks_exist())
    }

    /// Delete the whole file and prune emptied shard directories
    pub fn delete(&self) -> Result<bool> {
        let roots = self.store.roots();
        let removed = utils::safe_remove(&self.path, &roots)?;
        if removed {
            utils::prune_empty_parents(&self.path, 2, &roots[..1])?;
            trace!("Deleted content file {}", self.digest);
        }
        Ok(removed)
    }

    /// Delete every chunk, returning how many were removed
    pub fn delete_chunks(&self) -> Result<usize> {
        let mut removed = 0;
        for chunk in &self.chunks {
            if chunk.delete()? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete the whole file and all chunks
    pub fn delete_all(&self) -> Result<()> {
        self.delete()?;
        self.delete_chunks()?;
        Ok(())
    }
}

/// Fill `buffer` as far as the reader allows, returning the bytes read
fn read_window(reader: &mut impl Read, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

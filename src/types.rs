//! Core data types shared across Tessera
//!
//! ## Overview
//!
//! - **Ledger records**: [`TransactionRecord`], [`Method`], [`Compression`],
//!   [`Signature`] describe what a PUT or PATCH transaction declares about its
//!   payload
//! - **Resources**: [`Resource`], [`ResourceIdType`], [`Service`] identify
//!   something a reader can materialise
//! - **Configuration**: [`TesseraConfig`] holds roots, size bounds and timeouts
//!
//! ## Examples
//!
//! ```rust
//! use tessera::types::{Resource, ResourceIdType, Service};
//!
//! // Names are case-insensitive and "default" means no sub-identifier
//! let resource = Resource::new("MySite", ResourceIdType::Name, Service::Website, Some("default"));
//! assert_eq!(resource.resource_id, "mysite");
//! assert_eq!(resource.identifier, None);
//! assert_eq!(resource.unique_key(), "NAME:mysite:WEBSITE:default");
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TesseraError};

/// Default split size for payloads (512 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Largest chunk the store accepts (1 MiB)
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024;

/// Largest whole file the store accepts (500 MiB)
pub const MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Modified files up to this size are stored as line patches (100 KiB)
pub const MAX_PATCH_FILE_SIZE: u64 = 100 * 1024;

/// Name a single-file payload takes inside its resource directory
pub const SINGLE_FILE_NAME: &str = "data";

/// Sub-identifier used on disk when a resource has none
pub const DEFAULT_IDENTIFIER: &str = "default";

/// Transaction method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    /// Full snapshot of the resource
    Put,
    /// Layer of changes on top of the previous transaction
    Patch,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Put => write!(f, "PUT"),
            Method::Patch => write!(f, "PATCH"),
        }
    }
}

/// Payload container format
///
/// `None` stores a single file as-is. `Zip` archives a tree and deflates it
/// (the container is a gzip-compressed tar stream). `Lz4` archives a tree into
/// an LZ4 frame, trading ratio for speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Compression {
    /// Raw single file
    None,
    /// Deflate-compressed archive
    #[default]
    Zip,
    /// LZ4-framed archive
    Lz4,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "NONE"),
            Compression::Zip => write!(f, "ZIP"),
            Compression::Lz4 => write!(f, "LZ4"),
        }
    }
}

impl FromStr for Compression {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Compression::None),
            "ZIP" => Ok(Compression::Zip),
            "LZ4" => Ok(Compression::Lz4),
            other => Err(TesseraError::validation(format!("unknown compression kind {other}"))),
        }
    }
}

/// How a [`Resource`] is addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceIdType {
    /// Signature of a single transaction, looked up in the ledger
    Signature,
    /// Digest of a content file
    FileHash,
    /// A transaction record supplied by the caller
    TransactionData,
    /// Registered name; resolves to the latest state of its history
    Name,
}

impl fmt::Display for ResourceIdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceIdType::Signature => "SIGNATURE",
            ResourceIdType::FileHash => "FILE_HASH",
            ResourceIdType::TransactionData => "TRANSACTION_DATA",
            ResourceIdType::Name => "NAME",
        };
        f.write_str(s)
    }
}

/// Kind of content a resource carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Service {
    ArbitraryData,
    Website,
    App,
    File,
    Files,
    Document,
    Image,
    Audio,
    Video,
    Json,
    Blog,
}

impl Service {
    /// Every known service
    pub const ALL: [Service; 11] = [
        Service::ArbitraryData,
        Service::Website,
        Service::App,
        Service::File,
        Service::Files,
        Service::Document,
        Service::Image,
        Service::Audio,
        Service::Video,
        Service::Json,
        Service::Blog,
    ];

    /// Wire name, e.g. `ARBITRARY_DATA`
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::ArbitraryData => "ARBITRARY_DATA",
            Service::Website => "WEBSITE",
            Service::App => "APP",
            Service::File => "FILE",
            Service::Files => "FILES",
            Service::Document => "DOCUMENT",
            Service::Image => "IMAGE",
            Service::Audio => "AUDIO",
            Service::Video => "VIDEO",
            Service::Json => "JSON",
            Service::Blog => "BLOG",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_ascii_uppercase().replace('-', "_");
        Service::ALL
            .into_iter()
            .find(|service| service.as_str() == upper)
            .ok_or_else(|| TesseraError::validation(format!("unknown service {s}")))
    }
}

/// Transaction signature
///
/// Opaque bytes, rendered and serialized as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// Wrap raw signature bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Signature(bytes.into())
    }

    /// Parse a hex rendering
    pub fn from_hex(s: &str) -> Result<Self> {
        hex::decode(s)
            .map(Signature)
            .map_err(|e| TesseraError::validation(format!("invalid signature {s:?}: {e}")))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Signature({})", &hex[..hex.len().min(16)])
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map(Signature).map_err(serde::de::Error::custom)
    }
}

/// What a ledger transaction declares about its payload
///
/// Signing and consensus rules live outside this crate; the record is taken
/// as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction signature
    pub signature: Signature,
    /// Public key of the publisher
    pub creator_public_key: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Registered name the resource is published under
    pub name: Option<String>,
    /// Content kind
    pub service: Service,
    /// Sub-identifier, absent for the default resource of a name
    pub identifier: Option<String>,
    /// PUT or PATCH
    pub method: Method,
    /// Container format of the payload
    pub compression: Compression,
    /// Digest of the whole (encrypted) payload file
    pub data_hash: String,
    /// Ordered chunk digests; empty when the payload is a single chunk
    pub chunk_hashes: Vec<String>,
    /// Size of the whole payload file in bytes
    pub size: u64,
    /// Symmetric key, only present for the publisher's own uploads
    pub secret: Option<Vec<u8>>,
    /// Digest of the metadata sidecar file
    pub metadata_hash: Option<String>,
}

impl TransactionRecord {
    /// Normalised resource this transaction belongs to, if it carries a name
    pub fn resource(&self) -> Option<Resource> {
        self.name.as_deref().map(|name| {
            Resource::new(name, ResourceIdType::Name, self.service, self.identifier.as_deref())
        })
    }

    /// Number of files that must be present locally to read the payload
    pub fn file_count(&self) -> usize {
        self.chunk_hashes.len().max(1)
    }
}

/// Something a reader can materialise into a directory
///
/// Construction normalises the id: names are lower-cased and an empty or
/// `"default"` sub-identifier becomes `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    /// Name, signature hex or file digest depending on `id_type`
    pub resource_id: String,
    /// How `resource_id` is interpreted
    pub id_type: ResourceIdType,
    /// Content kind
    pub service: Service,
    /// Optional sub-identifier
    pub identifier: Option<String>,
}

impl Resource {
    /// Create a normalised resource reference
    pub fn new(
        resource_id: &str,
        id_type: ResourceIdType,
        service: Service,
        identifier: Option<&str>,
    ) -> Self {
        let resource_id = match id_type {
            ResourceIdType::Name => resource_id.to_lowercase(),
            _ => resource_id.to_string(),
        };
        Self {
            resource_id,
            id_type,
            service,
            identifier: normalize_identifier(identifier),
        }
    }

    /// Shorthand for a name-addressed resource
    pub fn by_name(name: &str, service: Service, identifier: Option<&str>) -> Self {
        Self::new(name, ResourceIdType::Name, service, identifier)
    }

    /// Sub-identifier as stored on disk
    pub fn identifier_or_default(&self) -> &str {
        self.identifier.as_deref().unwrap_or(DEFAULT_IDENTIFIER)
    }

    /// Key used by the rate limiter and the build queue
    pub fn unique_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.id_type,
            self.resource_id,
            self.service,
            self.identifier_or_default()
        )
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.service, self.resource_id, self.identifier_or_default())
    }
}

/// Treat empty and `"default"` sub-identifiers as absent
pub fn normalize_identifier(identifier: Option<&str>) -> Option<String> {
    match identifier.map(str::trim) {
        None | Some("") => None,
        Some(id) if id.eq_ignore_ascii_case(DEFAULT_IDENTIFIER) => None,
        Some(id) => Some(id.to_string()),
    }
}

/// Configuration for a Tessera instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesseraConfig {
    /// Root of the sharded content store
    pub data_path: PathBuf,
    /// Root for reader, writer, diff, merge and join working trees
    pub temp_path: PathBuf,
    /// Split size used when writing payloads
    pub chunk_size: usize,
    /// Upper bound for a single chunk
    pub max_chunk_size: u64,
    /// Upper bound for a whole payload file
    pub max_file_size: u64,
    /// Modified files up to this size may be stored as line patches
    pub max_patch_file_size: u64,
    /// Verify layer hashes after every fold step, not just the last
    pub validate_all_layers: bool,
    /// How long a fresh cache check suppresses the next one
    pub rate_limit_ttl: Duration,
    /// A build running longer than this is considered hung
    pub build_timeout: Duration,
    /// How long a failed build stays in the failed list
    pub failure_timeout: Duration,
    /// Worker threads for parallel file comparison
    pub parallel_workers: usize,
}

impl TesseraConfig {
    /// Defaults rooted at `base`: `base/data` and `base/temp`
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            data_path: base.join("data"),
            temp_path: base.join("temp"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            max_file_size: MAX_FILE_SIZE,
            max_patch_file_size: MAX_PATCH_FILE_SIZE,
            validate_all_layers: false,
            rate_limit_ttl: Duration::from_secs(60 * 60),
            build_timeout: Duration::from_secs(60),
            failure_timeout: Duration::from_secs(5 * 60),
            parallel_workers: num_cpus::get(),
        }
    }

    /// Check bounds and roots
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(TesseraError::InvalidConfiguration("chunk size must be positive".into()));
        }
        if self.chunk_size as u64 > self.max_chunk_size {
            return Err(TesseraError::InvalidConfiguration(format!(
                "chunk size {} exceeds max chunk size {}",
                self.chunk_size, self.max_chunk_size
            )));
        }
        if self.max_chunk_size > self.max_file_size {
            return Err(TesseraError::InvalidConfiguration(
                "max chunk size exceeds max file size".into(),
            ));
        }
        if self.data_path == self.temp_path
            || self.data_path.starts_with(&self.temp_path)
            || self.temp_path.starts_with(&self.data_path)
        {
            return Err(TesseraError::InvalidConfiguration(
                "data and temp roots must be disjoint".into(),
            ));
        }
        if self.parallel_workers == 0 {
            return Err(TesseraError::InvalidConfiguration(
                "parallel workers must be positive".into(),
            ));
        }
        Ok(())
    }
}

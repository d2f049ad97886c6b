//! # Tessera CLI
//!
//! Command-line access to a local Tessera store.
//!
//! ## Usage
//! ```bash
//! # Publish a directory, then an update to it
//! tessera put ./site --name alice --service website
//! tessera patch ./site --name alice --service website
//!
//! # Fold the history and copy the current state out
//! tessera build --name alice --service website --out ./alice-site
//!
//! # Work with layers directly
//! tessera diff ./v1 ./v2 --out ./layer
//! tessera merge ./v1 ./layer --out ./v2-rebuilt
//! tessera digest ./v2-rebuilt
//! ```
//!
//! Transactions are kept in `ledger.bin` beside the content store.

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera::digest::TreeDigest;
use tessera::diff::TreeDiffer;
use tessera::ledger::MemoryLedger;
use tessera::merge::TreeMerger;
use tessera::metadata::{TransactionMetadata, METADATA_DIR};
use tessera::types::MAX_PATCH_FILE_SIZE;
use tessera::{
    Compression, Resource, Service, StatusKind, Tessera, TesseraBuilder, TransactionRecord, WriteRequest,
};
use tracing_subscriber::EnvFilter;

/// Tessera CLI - layered, content-addressed resource storage
#[derive(Parser)]
#[command(name = "tessera")]
#[command(version)]
#[command(about = "Publish, patch and rebuild versioned directory trees")]
#[command(long_about = None)]
struct Cli {
    /// Content store root
    #[arg(short, long, global = true, default_value = ".tessera-store/data")]
    data: PathBuf,

    /// Temp root for working trees
    #[arg(short, long, global = true, default_value = ".tessera-store/temp")]
    temp: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Identifies a named resource
#[derive(clap::Args)]
struct ResourceArgs {
    /// Registered name
    #[arg(short, long)]
    name: String,

    /// Content kind
    #[arg(short, long, default_value = "website")]
    service: Service,

    /// Optional sub-identifier
    #[arg(short, long)]
    identifier: Option<String>,
}

impl ResourceArgs {
    fn resource(&self) -> Resource {
        Resource::by_name(&self.name, self.service, self.identifier.as_deref())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a full snapshot
    Put {
        /// File or directory to publish
        source: PathBuf,

        #[command(flatten)]
        resource: ResourceArgs,

        /// Container format (none, zip, lz4)
        #[arg(short, long, default_value = "zip")]
        compression: Compression,

        /// Title for the metadata sidecar
        #[arg(long)]
        title: Option<String>,

        /// Description for the metadata sidecar
        #[arg(long)]
        description: Option<String>,

        /// Search tags
        #[arg(long)]
        tag: Vec<String>,
    },

    /// Publish the changes since the latest transaction
    Patch {
        /// File or directory holding the new state
        source: PathBuf,

        #[command(flatten)]
        resource: ResourceArgs,

        /// Container format (zip, lz4)
        #[arg(short, long, default_value = "zip")]
        compression: Compression,
    },

    /// Build the current state of a resource
    Build {
        #[command(flatten)]
        resource: ResourceArgs,

        /// Rebuild even when the cached build is fresh
        #[arg(short, long)]
        force: bool,

        /// Copy the result here
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show the status of a resource
    #[command(alias = "st")]
    Status {
        #[command(flatten)]
        resource: ResourceArgs,
    },

    /// Print the digest of a directory tree
    Digest {
        /// Directory to hash
        path: PathBuf,
    },

    /// Compute the layer turning one tree into another
    Diff {
        /// Original tree
        before: PathBuf,

        /// Updated tree
        after: PathBuf,

        /// Where to write the layer
        #[arg(short, long)]
        out: PathBuf,

        /// Largest modified file stored as a line patch
        #[arg(long, default_value_t = MAX_PATCH_FILE_SIZE)]
        max_patch_size: u64,
    },

    /// Apply a layer to a tree
    Merge {
        /// Base tree
        base: PathBuf,

        /// Layer produced by `diff`
        layer: PathBuf,

        /// Where to write the merged tree
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Delete a resource's built tree and stored files
    Delete {
        #[command(flatten)]
        resource: ResourceArgs,

        /// Only delete the built tree
        #[arg(long)]
        cache_only: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        if let Some(err) = e.downcast_ref::<tessera::TesseraError>() {
            eprintln!("{}", err.user_message().dimmed());
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Put {
            source,
            resource,
            compression,
            title,
            description,
            tag,
        } => {
            let mut metadata = TransactionMetadata::default().with_tags(tag);
            if let Some(title) = title {
                metadata = metadata.with_title(title);
            }
            if let Some(description) = description {
                metadata = metadata.with_description(description);
            }
            let request = WriteRequest::put(source, &resource.name, resource.service)
                .with_identifier(resource.identifier.as_deref())
                .with_compression(compression)
                .with_metadata(metadata);
            cmd_publish(&cli.data, &cli.temp, request)
        }
        Commands::Patch {
            source,
            resource,
            compression,
        } => {
            let request = WriteRequest::patch(source, &resource.name, resource.service)
                .with_identifier(resource.identifier.as_deref())
                .with_compression(compression);
            cmd_publish(&cli.data, &cli.temp, request)
        }
        Commands::Build { resource, force, out } => cmd_build(&cli.data, &cli.temp, &resource, force, out),
        Commands::Status { resource } => cmd_status(&cli.data, &cli.temp, &resource),
        Commands::Digest { path } => {
            println!("{}", TreeDigest::compute(&path)?);
            Ok(())
        }
        Commands::Diff {
            before,
            after,
            out,
            max_patch_size,
        } => cmd_diff(&cli.temp, &before, &after, &out, max_patch_size),
        Commands::Merge { base, layer, out } => cmd_merge(&cli.temp, &base, &layer, &out),
        Commands::Delete { resource, cache_only } => cmd_delete(&cli.data, &cli.temp, &resource, cache_only),
    }
}

/// Write a payload and record its transaction
fn cmd_publish(data: &Path, temp: &Path, request: WriteRequest) -> anyhow::Result<()> {
    let (tessera, ledger) = open_tessera(data, temp)?;

    println!(
        "{} {} {}",
        format!("Publishing {}", request.method).blue().bold(),
        request.service,
        request.name.cyan()
    );
    let start = Instant::now();
    let pb = spinner("Compressing and encrypting...")?;
    let result = tessera.publish(&request);
    pb.finish_and_clear();
    let tx = result?;
    save_ledger(&ledger, data)?;

    print_transaction(&tx, start.elapsed());
    Ok(())
}

fn cmd_build(
    data: &Path,
    temp: &Path,
    args: &ResourceArgs,
    force: bool,
    out: Option<PathBuf>,
) -> anyhow::Result<()> {
    let (tessera, _) = open_tessera(data, temp)?;
    let resource = args.resource();

    let start = Instant::now();
    let pb = spinner("Folding layers...")?;
    let result = tessera.read(&resource, force);
    pb.finish_and_clear();

    let built = match result {
        Ok(built) => built,
        Err(e) if e.is_missing_data() => {
            println!("{} {}", "✗".red().bold(), e);
            for digest in e.missing_hashes() {
                println!("  missing {}", digest.yellow());
            }
            bail!("{} cannot be built until the missing files are fetched", resource);
        }
        Err(e) => return Err(e.into()),
    };

    println!("{} Built {}", "✓".green().bold(), resource.to_string().cyan());
    println!("  Digest: {}", TreeDigest::compute(&built)?.yellow());
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());

    match out {
        Some(out) => {
            let copied = copy_tree(&built, &out)?;
            println!("  Copied {} file(s) to {}", copied, out.display().to_string().cyan());
        }
        None => println!("  Path: {}", built.display().to_string().cyan()),
    }
    Ok(())
}

fn cmd_status(data: &Path, temp: &Path, args: &ResourceArgs) -> anyhow::Result<()> {
    let (tessera, _) = open_tessera(data, temp)?;
    let resource = args.resource();
    let status = tessera.status(&resource)?;

    let title = match status.kind {
        StatusKind::Ready | StatusKind::Downloaded => status.kind.title().green().bold(),
        StatusKind::Building | StatusKind::Published => status.kind.title().yellow().bold(),
        StatusKind::NotPublished | StatusKind::Unsupported => status.kind.title().dimmed(),
        _ => status.kind.title().red().bold(),
    };
    println!("{} {}", resource.to_string().cyan(), title);
    println!("  {}", status.kind.description());
    if let (Some(local), Some(total)) = (status.local_chunk_count, status.total_chunk_count) {
        println!("  Files: {}/{}", local, total);
    }
    Ok(())
}

fn cmd_diff(temp: &Path, before: &Path, after: &Path, out: &Path, max_patch_size: u64) -> anyhow::Result<()> {
    ensure_absent(out)?;
    let layer = TreeDiffer::new(temp, max_patch_size).diff(before, after, None)?;
    let manifest = layer.manifest().clone();
    let path = layer.into_path();
    let result = copy_tree(&path, out);
    fs::remove_dir_all(&path).with_context(|| format!("removing {}", path.display()))?;
    result?;

    println!("{} Layer written to {}", "✓".green().bold(), out.display().to_string().cyan());
    for key in &manifest.added {
        println!("  {} {}", "+".green(), key);
    }
    for modified in &manifest.modified {
        println!("  {} {} ({:?})", "~".yellow(), modified.path, modified.diff_type);
    }
    for key in &manifest.removed {
        println!("  {} {}", "-".red(), key);
    }
    Ok(())
}

fn cmd_merge(temp: &Path, base: &Path, layer: &Path, out: &Path) -> anyhow::Result<()> {
    ensure_absent(out)?;
    let merged = TreeMerger::new(temp).merge(base, layer)?;
    let result = copy_tree(&merged, out);
    fs::remove_dir_all(&merged).with_context(|| format!("removing {}", merged.display()))?;
    let copied = result?;

    println!(
        "{} Merged {} file(s) into {}",
        "✓".green().bold(),
        copied,
        out.display().to_string().cyan()
    );
    println!("  Digest: {}", TreeDigest::compute(out)?.yellow());
    Ok(())
}

fn cmd_delete(data: &Path, temp: &Path, args: &ResourceArgs, cache_only: bool) -> anyhow::Result<()> {
    let (tessera, _) = open_tessera(data, temp)?;
    let resource = args.resource();
    if cache_only {
        let removed = tessera.delete_cache(&resource)?;
        let msg = if removed { "Deleted built tree of" } else { "No built tree for" };
        println!("{} {} {}", "✓".green().bold(), msg, resource.to_string().cyan());
    } else {
        let count = tessera.delete(&resource)?;
        println!(
            "{} Deleted {} transaction payload(s) of {}",
            "✓".green().bold(),
            count,
            resource.to_string().cyan()
        );
    }
    Ok(())
}

fn open_tessera(data: &Path, temp: &Path) -> anyhow::Result<(Tessera, Arc<MemoryLedger>)> {
    let ledger = Arc::new(
        MemoryLedger::load(&ledger_path(data))
            .with_context(|| format!("loading ledger from {}", data.display()))?,
    );
    let base = data.parent().unwrap_or(Path::new("."));
    let tessera = TesseraBuilder::new()
        .data_path(data)
        .temp_path(temp)
        .memory_ledger(ledger.clone())
        .build(base)?;
    Ok((tessera, ledger))
}

fn save_ledger(ledger: &MemoryLedger, data: &Path) -> anyhow::Result<()> {
    ledger
        .save(&ledger_path(data))
        .with_context(|| format!("saving ledger to {}", data.display()))
}

fn ledger_path(data: &Path) -> PathBuf {
    data.join("ledger.bin")
}

fn spinner(message: &'static str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn print_transaction(tx: &TransactionRecord, elapsed: Duration) {
    println!("{} Published {}", "✓".green().bold(), tx.signature.to_hex()[..16].yellow().bold());
    println!("  Data: {}", tx.data_hash.cyan());
    println!("  Size: {}", format_bytes(tx.size).cyan());
    println!("  Chunks: {}", tx.file_count().to_string().cyan());
    if let Some(metadata) = &tx.metadata_hash {
        println!("  Metadata: {}", metadata.cyan());
    }
    println!("  Time: {}", format_duration(elapsed).to_string().cyan());
}

fn ensure_absent(out: &Path) -> anyhow::Result<()> {
    if out.exists() {
        bail!("{} already exists", out.display());
    }
    Ok(())
}

/// Copy regular files and directories from `src` into a new `dst`, leaving out sidecars
fn copy_tree(src: &Path, dst: &Path) -> anyhow::Result<usize> {
    let mut copied = 0;
    let walker = walkdir::WalkDir::new(src)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || e.file_name() != METADATA_DIR);
    for entry in walker {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {}", entry.path().display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree_skips_sidecars() {
        let temp = TempDir::new().unwrap();
        let built = temp.path().join("built");
        fs::create_dir_all(built.join(METADATA_DIR)).unwrap();
        fs::create_dir_all(built.join("docs")).unwrap();
        fs::write(built.join(METADATA_DIR).join("cache"), "{}").unwrap();
        fs::write(built.join("index.html"), "hi").unwrap();
        fs::write(built.join("docs").join(METADATA_DIR), "not a sidecar").unwrap();

        let out = temp.path().join("out");
        assert_eq!(copy_tree(&built, &out).unwrap(), 2);
        assert!(!out.join(METADATA_DIR).exists());
        assert!(out.join("docs").join(METADATA_DIR).exists());
    }
}

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chunkferry_core::backend::{DirBackend, NodeSelection};
use chunkferry_core::config::{
    DEFAULT_CHUNKS_DIR, DEFAULT_CHUNK_SIZE, DEFAULT_DOWNLOAD_DIR, DEFAULT_MAX_CHUNKS, DEFAULT_REPLICAS,
};
use chunkferry_core::download::OutputTarget;
use chunkferry_core::{CancelToken, Manifest, Orchestrator, RootHash, TransferConfig};

#[derive(Parser)]
#[command(name = "chunkferry", version, about = "Chunked, content-addressed file transfer")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
    #[command(flatten)]
    opts: Opts,
}

#[derive(clap::Args)]
struct Opts {
    /// Source file to split and upload
    #[arg(long, global = true, env = "CHUNKFERRY_INPUT")]
    input: Option<PathBuf>,
    /// Chunk size in bytes; K, M and G suffixes allowed
    #[arg(long, global = true, env = "CHUNKFERRY_CHUNK_SIZE", value_parser = parse_size, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    #[arg(long, global = true, env = "CHUNKFERRY_MAX_CHUNKS", default_value_t = DEFAULT_MAX_CHUNKS)]
    max_chunks: u32,
    #[arg(long, global = true, env = "CHUNKFERRY_REPLICAS", default_value_t = DEFAULT_REPLICAS)]
    replicas: u32,
    /// Per-chunk deadline; scales with chunk size when unset
    #[arg(long, global = true, env = "CHUNKFERRY_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,
    #[arg(long, global = true, env = "CHUNKFERRY_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,
    /// In-run re-attempts after a timeout or unavailable backend
    #[arg(long, global = true, env = "CHUNKFERRY_RETRIES", default_value_t = 0)]
    retries: u32,
    #[arg(long, global = true, env = "CHUNKFERRY_CHUNKS_DIR", default_value = DEFAULT_CHUNKS_DIR)]
    chunks_dir: PathBuf,
    #[arg(long, global = true, env = "CHUNKFERRY_DOWNLOAD_DIR", default_value = DEFAULT_DOWNLOAD_DIR)]
    download_dir: PathBuf,
    /// Manifest path; defaults to <chunks-dir>/manifest.json
    #[arg(long, global = true, env = "CHUNKFERRY_MANIFEST")]
    manifest: Option<PathBuf>,
    /// Root of the on-disk storage network
    #[arg(long, global = true, env = "CHUNKFERRY_STORE_DIR", default_value = "network")]
    store_dir: PathBuf,
    #[arg(long, global = true, env = "CHUNKFERRY_NODES", default_value_t = 3)]
    nodes: usize,
    /// Node selection: trusted or random
    #[arg(long, global = true, env = "CHUNKFERRY_SELECTION", default_value_t = NodeSelection::Trusted)]
    selection: NodeSelection,
    #[arg(long, global = true, default_value_t = false)]
    progress: bool,
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    /// Errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Cmd {
    /// Split the input into chunk files
    Split,
    /// Upload every chunk not yet uploaded, resuming from the manifest
    Upload,
    /// Download one object by root hash, or everything the manifest names
    Download {
        /// Root hash of a single object; omit to reassemble from --manifest
        root_hash: Option<RootHash>,
        /// File name under the download directory
        #[arg(requires = "root_hash")]
        output: Option<PathBuf>,
        /// Output file for a manifest download
        #[arg(long = "output", value_name = "FILE", conflicts_with = "root_hash")]
        output_file: Option<PathBuf>,
        /// Write one file per chunk into this directory instead
        #[arg(long, value_name = "DIR", conflicts_with_all = ["root_hash", "output_file"])]
        per_chunk: Option<PathBuf>,
    },
    /// Split, upload, download and verify
    All,
    /// Show the state of every chunk in a manifest
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.opts.verbose, cli.opts.quiet);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("interrupted; stopping after in-flight chunks");
            cancel.cancel();
        })
        .context("install Ctrl-C handler")?;
    }

    match cli.cmd {
        Cmd::Split => split(&orchestrator(&cli.opts, &cancel)?),
        Cmd::Upload => upload(&orchestrator(&cli.opts, &cancel)?),
        Cmd::Download { root_hash, output, output_file, per_chunk } => {
            let orch = orchestrator(&cli.opts, &cancel)?;
            match root_hash {
                Some(root) => download_one(&orch, root, output.as_deref()),
                None => download_manifest(&orch, &manifest_path(&cli.opts), output_file, per_chunk),
            }
        }
        Cmd::All => round_trip(&orchestrator(&cli.opts, &cancel)?),
        Cmd::Status => status(&manifest_path(&cli.opts)),
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let filter = if verbose > 0 || quiet {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn config(o: &Opts) -> TransferConfig {
    TransferConfig {
        input: o.input.clone().unwrap_or_default(),
        chunk_size: o.chunk_size,
        max_chunks: o.max_chunks,
        replicas: o.replicas,
        chunk_timeout: o.timeout_secs.map(Duration::from_secs),
        concurrency: o.concurrency,
        retries: o.retries,
        chunks_dir: o.chunks_dir.clone(),
        download_dir: o.download_dir.clone(),
        manifest_path: o.manifest.clone(),
        progress: o.progress,
    }
}

fn manifest_path(o: &Opts) -> PathBuf {
    config(o).manifest_path()
}

fn orchestrator(o: &Opts, cancel: &CancelToken) -> Result<Orchestrator> {
    let backend = DirBackend::open(&o.store_dir, o.nodes, o.replicas as usize, o.selection)
        .with_context(|| format!("open storage network at {}", o.store_dir.display()))?;
    let orch = Orchestrator::new(config(o), Arc::new(backend))?;
    Ok(orch.with_cancel(cancel.clone()))
}

fn require_input(orch: &Orchestrator) -> Result<()> {
    let input = &orch.config().input;
    if input.as_os_str().is_empty() {
        bail!("no input file; pass --input or set CHUNKFERRY_INPUT");
    }
    if !input.is_file() {
        bail!("input {} is not a file", input.display());
    }
    Ok(())
}

fn split(orch: &Orchestrator) -> Result<()> {
    require_input(orch)?;
    let chunks = orch.split()?;
    for c in &chunks {
        println!("{}\t{}", c.source_path.display(), c.size);
    }
    info!(chunks = chunks.len(), "split complete");
    Ok(())
}

fn upload(orch: &Orchestrator) -> Result<()> {
    // Re-split whenever the input is at hand so edits since the last split
    // are never hidden behind old chunk files.
    let chunks = if orch.config().input.is_file() {
        orch.split()?
    } else {
        match orch.discover() {
            Ok(chunks) => chunks,
            Err(e) => {
                require_input(orch)?;
                return Err(e.into());
            }
        }
    };
    let outcome = orch.upload(&chunks)?;
    print_manifest(&outcome.manifest);
    println!("manifest: {}", orch.config().manifest_path().display());
    match outcome.first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn download_one(orch: &Orchestrator, root: RootHash, output: Option<&Path>) -> Result<()> {
    let report = orch.download_root(root, output)?;
    println!("{} -> {} ({} bytes)", root, report.output.display(), report.bytes);
    Ok(())
}

fn download_manifest(
    orch: &Orchestrator,
    manifest: &Path,
    output_file: Option<PathBuf>,
    per_chunk: Option<PathBuf>,
) -> Result<()> {
    let target = match (output_file, per_chunk) {
        (_, Some(dir)) => OutputTarget::Directory(dir),
        (Some(file), None) => OutputTarget::File(file),
        (None, None) => {
            let m = Manifest::load(manifest)?;
            if m.source.source_name.is_empty() {
                bail!("manifest {} names no source file; pass --output", manifest.display());
            }
            OutputTarget::File(orch.config().download_dir.join(&m.source.source_name))
        }
    };
    let report = orch.download_manifest(manifest, &target)?;
    println!("{} chunks, {} bytes -> {}", report.chunks, report.bytes, report.output.display());
    Ok(())
}

fn round_trip(orch: &Orchestrator) -> Result<()> {
    require_input(orch)?;
    let report = orch.run_round_trip();
    if let Some(m) = &report.manifest {
        print_manifest(m);
    }
    if let Some(e) = report.failure {
        return Err(e.into());
    }
    let v = report.verification.ok_or_else(|| anyhow!("round trip produced no verification report"))?;
    if let Some(out) = &report.reassembled {
        println!("reassembled: {}", out.display());
    }
    println!(
        "verified {} chunks, {} bytes: {}",
        v.chunks_ok,
        v.bytes_compared,
        if v.identical() { "OK" } else { "MISMATCH" }
    );
    Ok(())
}

fn status(path: &Path) -> Result<()> {
    let m = Manifest::load(path).with_context(|| format!("load manifest {}", path.display()))?;
    println!(
        "{} ({} bytes, {} chunks of up to {} bytes, {} replica(s))",
        m.source.source_name,
        m.source.source_size,
        m.records.len(),
        m.source.chunk_size,
        m.source.replicas
    );
    for r in &m.records {
        let root = r.root_hash.map(|h| h.to_string()).unwrap_or_else(|| "-".into());
        let mut line = format!("{:>3}  {:<9}  {}  attempts={}", r.index, r.state.to_string(), root, r.attempts);
        if r.verified {
            line.push_str("  verified");
        }
        if let Some(e) = &r.error {
            line.push_str(&format!("  error: {e}"));
        }
        println!("{line}");
    }
    println!("complete: {}", if m.is_complete() { "yes" } else { "no" });
    Ok(())
}

fn print_manifest(m: &Manifest) {
    for r in &m.records {
        match &r.root_hash {
            Some(h) => println!("{} -> {}", r.file_name(), h),
            None => println!("{} -> ({})", r.file_name(), r.state),
        }
    }
}

fn parse_size(s: &str) -> Result<usize, String> {
    let t = s.trim().to_ascii_uppercase();
    let (num, mul) = match t.chars().last() {
        Some('K') => (&t[..t.len() - 1], 1usize << 10),
        Some('M') => (&t[..t.len() - 1], 1 << 20),
        Some('G') => (&t[..t.len() - 1], 1 << 30),
        _ => (&t[..], 1),
    };
    let v: usize = num.trim().parse().map_err(|_| format!("bad size {s:?}"))?;
    let bytes = v.checked_mul(mul).ok_or_else(|| format!("size {s:?} overflows"))?;
    if bytes == 0 {
        return Err("size must be > 0".into());
    }
    Ok(bytes)
}

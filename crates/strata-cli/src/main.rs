//! strata - Excavate nested and encrypted firmware containers
//!
//! This tool recognises container formats in firmware blobs, brute-forces
//! the AES key of sealed images against a keyring, and unpacks everything
//! recursively into an output directory.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::builtin::{builtin_finder, EnvelopeConfig};
use strata_core::keys::AES_BLOCK_SIZE;
use strata_core::{
    ArtifactSink, DataSource, ExtractionReport, FileSink, FormatFinder, KeyBundle, KeyResolver,
    MemorySink, Orchestrator, OrchestratorConfig, VfsDirectory,
};
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Excavate nested and encrypted firmware containers
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect, decrypt and unpack containers recursively
    Extract(ExtractArgs),

    /// Inspect a keyring or search it by hand
    #[command(subcommand)]
    Keys(KeysCommand),

    /// List the registered formats in tie-break order
    Formats,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    #[command(flatten)]
    input: InputMode,

    /// Output directory for extracted artifacts
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    #[command(flatten)]
    keyring: KeyringArgs,

    /// Deepest nesting level to descend into (input is level 0)
    #[arg(long)]
    max_depth: Option<usize>,

    /// Dry run - don't write files, just show what would be extracted
    #[arg(long)]
    dry_run: bool,

    /// Overwrite existing files without prompting
    #[arg(long)]
    force: bool,

    /// Print the extraction tree when done
    #[arg(long)]
    tree: bool,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputMode {
    /// Path to a single firmware file
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to a directory of firmware files to process
    #[arg(short, long)]
    directory: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct KeyringArgs {
    /// Keyring file, one hex key (and optional IV) per line
    #[arg(long, env = "STRATA_KEYS")]
    keys: Option<PathBuf>,

    /// Only try keys of this collection
    #[arg(long)]
    collection: Option<String>,
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /// Validate a keyring and print its keys (never the key material)
    List {
        /// Keyring file
        #[arg(long, env = "STRATA_KEYS")]
        keys: PathBuf,

        /// Only list keys of this collection
        #[arg(long)]
        collection: Option<String>,
    },

    /// Find the key that decrypts a file to a known leading magic
    Find {
        /// Keyring file
        #[arg(long, env = "STRATA_KEYS")]
        keys: PathBuf,

        /// Encrypted file
        #[arg(short, long)]
        input: PathBuf,

        /// Expected plaintext prefix, in hex
        #[arg(long, value_parser = parse_magic)]
        magic: Magic,

        /// Only try keys of this collection
        #[arg(long)]
        collection: Option<String>,

        /// Write the decrypted file here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing output file
        #[arg(long)]
        force: bool,
    },
}

/// Plaintext prefix given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
struct Magic(Vec<u8>);

fn parse_magic(s: &str) -> std::result::Result<Magic, String> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(&digits);
    if digits.is_empty() {
        return Err("magic must not be empty".to_string());
    }
    hex::decode(digits)
        .map(Magic)
        .map_err(|e| format!("invalid hex magic: {}", e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    match &cli.command {
        Command::Extract(args) => run_extract(args),
        Command::Keys(KeysCommand::List { keys, collection }) => {
            list_keys(keys, collection.as_deref())
        }
        Command::Keys(KeysCommand::Find {
            keys,
            input,
            magic,
            collection,
            output,
            force,
        }) => find_key(keys, input, magic, collection.as_deref(), output.as_deref(), *force),
        Command::Formats => list_formats(),
    }
}

/// Loads the keyring, or an empty one when none was given
fn load_keys(path: Option<&Path>) -> Result<KeyBundle> {
    let Some(path) = path else {
        debug!("No keyring given, encrypted containers will not be opened");
        return Ok(KeyBundle::empty());
    };
    let bundle = KeyBundle::load(path)
        .with_context(|| format!("Failed to load keyring: {}", path.display()))?;
    info!("Loaded {} key(s) from {}", bundle.parsed_len(), path.display());
    Ok(bundle)
}

fn run_extract(args: &ExtractArgs) -> Result<()> {
    let keys = Arc::new(load_keys(args.keyring.keys.as_deref())?);
    let envelope = EnvelopeConfig::new().collection(args.keyring.collection.clone());
    let finder = builtin_finder(keys, envelope)?;
    let mut tree = VfsDirectory::new(args.output.display().to_string());

    // Dispatch based on input mode
    if let Some(ref file) = args.input.file {
        process_single_file(args, &finder, file, &mut tree)?;
    } else if let Some(ref directory) = args.input.directory {
        process_directory(args, &finder, directory, &mut tree)?;
    } else {
        bail!("Either --file or --directory must be specified")
    }

    if args.tree {
        print!("{}", tree.render());
    }
    Ok(())
}

/// Process a single firmware file
fn process_single_file(
    args: &ExtractArgs,
    finder: &FormatFinder,
    file: &Path,
    tree: &mut VfsDirectory,
) -> Result<()> {
    if !file.exists() {
        bail!("Input file does not exist: {}", file.display());
    }
    if !file.is_file() {
        bail!("Input path is not a file: {}", file.display());
    }

    let report = process_firmware(args, finder, file, &args.output, tree)?;
    print_summary(&[report]);
    Ok(())
}

/// Process a directory of firmware files recursively
fn process_directory(
    args: &ExtractArgs,
    finder: &FormatFinder,
    directory: &Path,
    tree: &mut VfsDirectory,
) -> Result<()> {
    if !directory.exists() {
        bail!("Directory does not exist: {}", directory.display());
    }
    if !directory.is_dir() {
        bail!("Path is not a directory: {}", directory.display());
    }

    info!("Scanning directory: {}", directory.display());

    let mut reports = Vec::new();

    for entry in WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        if !path.is_file() || is_hidden(path) {
            continue;
        }

        let output_root = output_root_for(&args.output, directory, path);
        // Same-named files in different subdirectories get separate mounts
        let mount = tree.directory_at(&relative_parent(directory, path));
        debug!("Processing firmware: {}", path.display());
        match process_firmware(args, finder, path, &output_root, mount) {
            Ok(report) => reports.push(report),
            // Log error but continue with other files
            Err(e) => warn!("Error processing {}: {:#}", path.display(), e),
        }
    }

    info!("Processed {} file(s)", reports.len());
    print_summary(&reports);
    Ok(())
}

/// Skips dotfiles
fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Subdirectory holding `file`, relative to the walked `directory`
fn relative_parent(directory: &Path, file: &Path) -> PathBuf {
    file.parent()
        .and_then(|parent| parent.strip_prefix(directory).ok())
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// Mirrors the input's subdirectory below the output directory
fn output_root_for(output: &Path, directory: &Path, file: &Path) -> PathBuf {
    let relative = relative_parent(directory, file);
    if relative.as_os_str().is_empty() {
        output.to_path_buf()
    } else {
        output.join(relative)
    }
}

/// File name used for the top-level data source
fn input_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string())
}

/// Runs the orchestrator over one file
fn process_firmware(
    args: &ExtractArgs,
    finder: &FormatFinder,
    path: &Path,
    output_root: &Path,
    tree: &mut VfsDirectory,
) -> Result<ExtractionReport> {
    trace!("Reading {}", path.display());
    let data =
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?;
    trace!("Read {} bytes from {}", data.len(), path.display());

    let input = DataSource::input(input_name(path), data, output_root);
    let config = OrchestratorConfig::new().max_depth(args.max_depth);
    let tree = args.tree.then_some(tree);

    if args.dry_run {
        let mut orchestrator = Orchestrator::new(finder, MemorySink::new()).with_config(config);
        let report = excavate(&mut orchestrator, &input, tree)
            .with_context(|| format!("Failed to extract {}", path.display()))?;
        for (output_path, bytes) in orchestrator.sink().files() {
            println!(
                "Would write {} ({})",
                output_path.display(),
                content_hash(bytes)
            );
        }
        Ok(report)
    } else {
        let sink = FileSink::new(&args.output).force(args.force);
        let mut orchestrator = Orchestrator::new(finder, sink).with_config(config);
        let result = excavate(&mut orchestrator, &input, tree);
        // Artifacts written before a failure stay on disk
        for written in orchestrator.sink().written() {
            println!("Wrote {}", written.display());
        }
        result.with_context(|| format!("Failed to extract {}", path.display()))
    }
}

fn excavate<S: ArtifactSink>(
    orchestrator: &mut Orchestrator<'_, S>,
    input: &DataSource,
    tree: Option<&mut VfsDirectory>,
) -> strata_core::Result<ExtractionReport> {
    match tree {
        Some(tree) => orchestrator.run_with_vfs(input, tree),
        None => orchestrator.run(input),
    }
}

/// Compute a short hash of the content (first 8 chars of blake3)
fn content_hash(content: &[u8]) -> String {
    let hash = blake3::hash(content);
    hash.to_hex()[..8].to_string()
}

fn print_summary(reports: &[ExtractionReport]) {
    let total = reports
        .iter()
        .fold(ExtractionReport::default(), |mut acc, r| {
            acc.nodes_visited += r.nodes_visited;
            acc.nodes_matched += r.nodes_matched;
            acc.artifacts_written += r.artifacts_written;
            acc.artifacts_unplaced += r.artifacts_unplaced;
            acc.depth_capped += r.depth_capped;
            acc
        });
    info!(
        "Summary: {} node(s) visited, {} recognised, {} written, {} unplaced, {} depth-capped",
        total.nodes_visited,
        total.nodes_matched,
        total.artifacts_written,
        total.artifacts_unplaced,
        total.depth_capped
    );
}

fn list_keys(path: &Path, collection: Option<&str>) -> Result<()> {
    let bundle = KeyBundle::load(path)
        .with_context(|| format!("Failed to load keyring: {}", path.display()))?;

    for (index, entry) in bundle.iter().enumerate() {
        let entry = entry?;
        if collection.is_some_and(|c| !entry.belongs_to(c)) {
            continue;
        }
        println!(
            "{:>4}  {} {}  [{}]  {}",
            index,
            entry.cipher().as_str(),
            entry.mode().as_str(),
            entry.collections().join(", "),
            entry.comment()
        );
    }
    Ok(())
}

/// Bytes to trial-decrypt so the whole magic is covered
fn probe_len(magic_len: usize, available: usize) -> usize {
    (magic_len.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE).min(available)
}

fn find_key(
    keys: &Path,
    input: &Path,
    magic: &Magic,
    collection: Option<&str>,
    output: Option<&Path>,
    force: bool,
) -> Result<()> {
    let bundle = KeyBundle::load(keys)
        .with_context(|| format!("Failed to load keyring: {}", keys.display()))?;
    let data =
        fs::read(input).with_context(|| format!("Failed to read input file: {}", input.display()))?;

    let probe = &data[..probe_len(magic.0.len(), data.len())];
    let resolver = KeyResolver::new(&bundle);
    let Some(resolved) = resolver.resolve(collection, probe, |p| p.starts_with(&magic.0))? else {
        bail!(
            "No key in {} decrypts {} to {}",
            keys.display(),
            input.display(),
            hex::encode(&magic.0)
        );
    };

    println!(
        "Key from line {} ({} {}) {}",
        resolved.entry.line(),
        resolved.entry.cipher().as_str(),
        resolved.entry.mode().as_str(),
        resolved.entry.comment()
    );

    if let Some(output) = output {
        let plaintext = resolved.decryptor.decrypt(&data);
        write_file(output, &plaintext, force)?;
        println!("Wrote {}", output.display());
    }
    Ok(())
}

fn list_formats() -> Result<()> {
    let finder = builtin_finder(Arc::new(KeyBundle::empty()), EnvelopeConfig::default())?;
    for (id, description) in finder.describe() {
        println!("{:<16} {}", id, description);
    }
    Ok(())
}

/// Write a file to disk, refusing to clobber unless forced
fn write_file(output_path: &Path, content: &[u8], force: bool) -> Result<()> {
    // Create parent directories
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    // Check if file exists
    if output_path.exists() && !force {
        bail!(
            "File already exists: {} (use --force to overwrite)",
            output_path.display()
        );
    }

    let mut file = fs::File::create(output_path)
        .with_context(|| format!("Failed to create file: {}", output_path.display()))?;

    file.write_all(content)
        .with_context(|| format!("Failed to write file: {}", output_path.display()))?;

    Ok(())
}

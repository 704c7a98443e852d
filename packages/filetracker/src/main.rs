use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filetracker::{
    CommitOutcome, ContentHash, FileTracker, JsonCodec, MetaStore, MetadataCodec, ObjectIndex,
    TrackerConfig,
};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Parser)]
#[command(name = "filetracker")]
#[command(about = "Per-disk object index", long_about = None)]
#[command(version)]
struct Cli {
    /// Disk root, overriding FILETRACKER_ROOT and the config file
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Index(IndexCommand),

    /// Write a config file for the disk root and create its layout
    Init {
        /// Number of high hash bits used to pick a partition (1-8)
        #[arg(long, default_value_t = 6)]
        partition_power: u8,
    },
}

#[derive(Subcommand)]
enum IndexCommand {
    /// Store a file under its content hash
    Put {
        /// Path to the file to store
        file: PathBuf,

        /// Content hash to store under (default: BLAKE3/128 of the file)
        #[arg(long)]
        hash: Option<String>,

        /// Shard number
        #[arg(long, default_value_t = 0)]
        shard: u32,

        /// Write timestamp (default: now, in nanoseconds)
        #[arg(long)]
        timestamp: Option<i64>,

        /// Metadata entry, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },

    /// Show the current version of a hash
    Get {
        /// Content hash
        hash: String,

        /// Shard number
        #[arg(long, default_value_t = 0)]
        shard: u32,
    },

    /// List records in an inclusive hash range
    List {
        /// First hash of the range
        start: String,

        /// Last hash of the range
        stop: String,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))
}

fn now_nanos() -> Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock is before the Unix epoch")?;
    i64::try_from(elapsed.as_nanos()).context("Timestamp out of range")
}

async fn put(
    index: &dyn ObjectIndex,
    file: PathBuf,
    hash: Option<String>,
    shard: u32,
    timestamp: i64,
    meta: Vec<(String, String)>,
) -> Result<()> {
    let hash = match hash {
        Some(hash) => hash,
        None => ContentHash::from_file(&file)?.to_hex(),
    };

    let mut source = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("Failed to open file: {}", file.display()))?;
    let size_hint = source.metadata().await.ok().map(|m| m.len());

    let mut handle = index.temp_file(&hash, size_hint).await?;
    tokio::io::copy(&mut source, &mut handle)
        .await
        .with_context(|| format!("Failed to copy {} into temp file", file.display()))?;

    let metadata = if meta.is_empty() {
        None
    } else {
        let mut store = MetaStore::new();
        for (key, value) in meta {
            store.set(key, timestamp, value);
        }
        Some((JsonCodec.hash(&store), JsonCodec.encode(&store)?))
    };

    let outcome = index
        .commit(
            handle,
            &hash,
            shard,
            timestamp,
            metadata.as_ref().map(|(metahash, _)| metahash.as_str()),
            metadata.as_ref().map(|(_, bytes)| bytes.as_slice()),
        )
        .await?;

    match outcome {
        CommitOutcome::Inserted => println!("stored {} shard {} at {}", hash, shard, timestamp),
        CommitOutcome::Replaced { previous_timestamp } => println!(
            "stored {} shard {} at {} (replaced {})",
            hash, shard, timestamp, previous_timestamp
        ),
        CommitOutcome::Stale { stored_timestamp } => println!(
            "discarded: {} shard {} already stored at {}",
            hash, shard, stored_timestamp
        ),
    }
    Ok(())
}

async fn get(index: &dyn ObjectIndex, hash: String, shard: u32) -> Result<()> {
    let entry = index.lookup(&hash, shard).await?;

    println!("hash:      {}", entry.hash);
    println!("shard:     {}", entry.shard);
    println!("timestamp: {}", entry.timestamp);
    println!("metahash:  {}", entry.metahash.as_deref().unwrap_or("-"));
    println!("path:      {}", entry.path.display());
    if let Some(bytes) = entry.metadata {
        match JsonCodec.decode(&bytes) {
            Ok(store) if store.is_empty() => println!("metadata:  -"),
            Ok(store) => {
                println!("metadata:");
                for line in metadata_lines(&store) {
                    println!("  {}", line);
                }
            }
            Err(e) => println!("metadata:  <undecodable: {}>", e),
        }
    }
    Ok(())
}

fn metadata_lines(store: &MetaStore) -> Vec<String> {
    store
        .keys()
        .filter_map(|key| store.entry(key).map(|entry| (key, entry)))
        .map(|(key, entry)| format!("{} = {} (ts {})", key, entry.value, entry.ts))
        .collect()
}

async fn list(index: &dyn ObjectIndex, start: String, stop: String) -> Result<()> {
    for item in index.list(&start, &stop).await? {
        println!(
            "{} {:02x} {:019} {}",
            item.hash,
            item.shard,
            item.timestamp,
            item.metahash.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run(index: &dyn ObjectIndex, command: IndexCommand) -> Result<()> {
    match command {
        IndexCommand::Put {
            file,
            hash,
            shard,
            timestamp,
            meta,
        } => {
            let timestamp = match timestamp {
                Some(timestamp) => timestamp,
                None => now_nanos()?,
            };
            tracing::info!("Storing file: {}", file.display());
            put(index, file, hash, shard, timestamp, meta).await
        }
        IndexCommand::Get { hash, shard } => get(index, hash, shard).await,
        IndexCommand::List { start, stop } => list(index, start, stop).await,
    }
}

async fn init(mut config: TrackerConfig, partition_power: u8) -> Result<()> {
    config.partition_power = partition_power;
    config.validate()?;
    let path = config.save().await?;

    let tracker = FileTracker::open(&config)
        .await
        .with_context(|| format!("Failed to initialize {}", config.root.display()))?;
    tracker.close().await;

    println!("initialized {} (config: {})", config.root.display(), path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = TrackerConfig::load().await?;
    if let Some(root) = cli.root {
        config.root = root;
    }

    match cli.command {
        Commands::Init { partition_power } => init(config, partition_power).await,
        Commands::Index(command) => {
            let tracker = FileTracker::open(&config)
                .await
                .with_context(|| format!("Failed to open {}", config.root.display()))?;
            let result = run(&tracker, command).await;
            tracker.close().await;
            result
        }
    }
}

use anyhow::Context;
use chrono::SecondsFormat;
use clap::{Parser, Subcommand, ValueEnum};
use cloudstash::config::{CacheSettings, CloudstashConfig};
use cloudstash::context::CacheContext;
use cloudstash::hash::{ContentHash, hash_file};
use cloudstash::object::split_cache_key;
use cloudstash::store::ResourceClass;
use cloudstash::store::eviction::{LruPolicy, is_valid_fraction};
use cloudstash::store::meta::{CacheMetadataRecord, EntryOrigin};
use cloudstash::util::humanbytes::{format_bytes, parse_bytes_from_str};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Maintenance of the local cloudstash cache
///
/// cloudstash keeps local copies of remote objects and table scans and only refetches them when
/// the remote side changed. This tool inspects and cleans the local cache directory.
///
/// Settings are read from the file named by CLOUDSTASH_CONFIG_FILE (or the platform config
/// directory) and CLOUDSTASH_* environment variables.
#[derive(Parser)]
#[command(version)]
struct CliOpts {
    /// Path to the cache directory, overriding the configured one.
    #[arg(short, long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log more details. Can be repeated.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evict entries from the cache.
    ///
    /// Limits not given on the command line are taken from the configuration.
    Clean {
        /// Maximum age of last access before entries are deleted.
        #[arg(long)]
        max_age: Option<humantime::Duration>,

        /// Maximum total payload size, e.g. "50GiB".
        ///
        /// This doesn't account for metadata, thus the overall cache size may be a bit larger.
        #[arg(long, value_parser = parse_bytes_from_str)]
        max_size: Option<u64>,

        /// Maximum fraction (0 to 1) of the free disk space the cache may use.
        #[arg(long, value_parser = parse_fraction)]
        max_fraction_of_free: Option<f64>,
    },

    /// Calculate the content hash of a file, as embedded in uploaded objects.
    Hash {
        /// File to hash.
        path: PathBuf,
    },

    /// Remove a single entry from the cache.
    Invalidate {
        #[command(flatten)]
        target: InvalidateTarget,
    },

    /// List cached entries.
    List {
        /// Only list entries of this class.
        #[arg(long, value_enum)]
        class: Option<ClassArg>,
    },

    /// Remove all entries from the cache.
    Purge,
}

#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct InvalidateTarget {
    /// Cached object, given as BUCKET/KEY.
    #[arg(long)]
    object: Option<String>,

    /// Cached table scan, given by table name.
    #[arg(long)]
    table: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ClassArg {
    Objects,
    Tables,
}

impl From<ClassArg> for ResourceClass {
    fn from(class: ClassArg) -> Self {
        match class {
            ClassArg::Objects => ResourceClass::Objects,
            ClassArg::Tables => ResourceClass::Tables,
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let default_directive = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_fraction(input: &str) -> Result<f64, String> {
    let fraction: f64 = input.trim().parse().map_err(|err| format!("{err}"))?;
    if is_valid_fraction(fraction) {
        Ok(fraction)
    } else {
        Err(format!("{input} is not within 0 and 1"))
    }
}

fn open_context(cache_dir: Option<PathBuf>) -> Result<CacheContext, anyhow::Error> {
    let mut config = CloudstashConfig::load().context("Could not load configuration")?;
    if let Some(cache_dir) = cache_dir {
        config.cache_dir = cache_dir.to_string_lossy().into_owned();
    }
    let settings = CacheSettings::try_from(config).context("Invalid configuration")?;
    let context = CacheContext::open(settings)?;
    tracing::debug!(cache_dir = %context.store().root().display(), "opened cache");
    Ok(context)
}

/// The hash identifying the remote content of a cached entry.
fn display_hash(record: &CacheMetadataRecord) -> ContentHash {
    match &record.origin {
        EntryOrigin::Object(origin) => match (origin.remote_hash, split_cache_key(&record.key)) {
            (Some(hash), _) => hash,
            (None, Some((bucket, key))) => ContentHash::substitute(
                bucket,
                key,
                origin.size,
                origin.last_modified,
                &origin.etag,
            ),
            (None, None) => record.local_hash,
        },
        EntryOrigin::Table(_) => record.local_hash,
    }
}

fn main() -> Result<ExitCode, anyhow::Error> {
    let cli_opts = CliOpts::parse();
    init_logging(cli_opts.verbose, cli_opts.quiet);

    match cli_opts.command {
        Commands::Clean {
            max_age,
            max_size,
            max_fraction_of_free,
        } => {
            let context = open_context(cli_opts.cache_dir)?;
            let configured = &context.settings().eviction;
            let policy = LruPolicy {
                max_unused_age: max_age
                    .map(|max_age| chrono::TimeDelta::from_std(*max_age.as_ref()))
                    .transpose()?
                    .or(configured.max_unused_age),
                max_size: max_size.or(configured.max_size),
                max_fraction_of_free: max_fraction_of_free.or(configured.max_fraction_of_free),
            };
            context.store().clean_leftover_tmp_files()?;
            let stats = context
                .store()
                .clean(&policy)
                .context("Could not clean cache")?;
            println!(
                "Evicted {} entries ({}), {} entries ({}) remaining.",
                stats.evicted_entries,
                format_bytes(stats.freed_bytes),
                stats.remaining_entries,
                format_bytes(stats.remaining_bytes),
            );
        }
        Commands::Hash { path } => {
            let hash =
                hash_file(&path).with_context(|| format!("Could not hash: {}", path.display()))?;
            println!("{hash}");
        }
        Commands::Invalidate { target } => {
            let context = open_context(cli_opts.cache_dir)?;
            let (class, key) = match (target.object, target.table) {
                (Some(object), _) if split_cache_key(&object).is_none() => {
                    anyhow::bail!("Object must be given as BUCKET/KEY: {object}");
                }
                (Some(object), _) => (ResourceClass::Objects, object),
                (None, Some(table)) => (ResourceClass::Tables, table),
                (None, None) => anyhow::bail!("Either --object or --table is required"),
            };
            if context.store().get_metadata(class, &key).is_none() {
                eprintln!("Not cached: {key}");
                return Ok(ExitCode::from(2));
            }
            context
                .store()
                .invalidate(class, &key)
                .with_context(|| format!("Could not invalidate: {key}"))?;
        }
        Commands::List { class } => {
            let context = open_context(cli_opts.cache_dir)?;
            let classes = match class {
                Some(class) => vec![class.into()],
                None => ResourceClass::ALL.to_vec(),
            };
            for class in classes {
                for record in context.store().entries(class)? {
                    println!(
                        "{class}\t{}\t{}\t{}\t{}",
                        record.key,
                        format_bytes(record.payload_size),
                        record
                            .latest_access
                            .to_rfc3339_opts(SecondsFormat::Secs, true),
                        display_hash(&record),
                    );
                }
            }
        }
        Commands::Purge => {
            open_context(cli_opts.cache_dir)?
                .purge()
                .context("Could not purge cache")?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

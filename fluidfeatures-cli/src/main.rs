use std::path::Path;
use std::process;

use clap::{Parser, Subcommand};
use fluidfeatures::client::{Api, FeaturesResponse, HttpClient};
use fluidfeatures::store::{BucketStore, SledBuckets};
use fluidfeatures::{assign, store, CacheConfig, Config, FeatureSnapshot, User, UserId};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ffc")]
#[command(version)]
#[command(about = "Inspect FluidFeatures flag state and the local reporting backlog", long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(short = 'c', long = "config", default_value = "fluidfeatures.toml")]
    config: String,

    /// Config file section to use on top of [common]
    #[arg(
        short = 'e',
        long = "env",
        env = "FLUIDFEATURES_ENV",
        default_value = "development"
    )]
    env: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every feature the remote authority knows about, as JSON
    Features,
    /// Evaluate one feature version for a user
    Check {
        /// Feature name
        feature: String,

        /// User id; all-digit ids are treated as numbers
        #[arg(short = 'u', long = "user")]
        user: String,

        /// Version name (defaults to "default")
        #[arg(short = 'v', long = "version")]
        version: Option<String>,

        /// User attributes as key=value pairs (e.g. --attr company=acme)
        #[arg(short = 'a', long = "attr")]
        attrs: Vec<String>,
    },
    /// Show the transaction backlog persisted in the cache dir
    Backlog,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &str, env: &str) -> Config {
    let mut builder = fluidfeatures::init();
    if Path::new(path).exists() {
        builder = builder.config_file(path, env);
    } else {
        info!("{} not found, using environment only", path);
    }
    match builder.config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            process::exit(1);
        }
    }
}

/// Fetches the snapshot, falling back to the one persisted in the cache dir.
fn load_snapshot(config: &Config) -> FeatureSnapshot {
    if let Err(e) = config.validate() {
        warn!("not fetching features: {}", e);
    } else {
        match HttpClient::new(config).and_then(|client| client.get_features(None, false)) {
            Ok(FeaturesResponse::Changed(snapshot)) => return snapshot,
            Ok(FeaturesResponse::NotModified) => {}
            Err(e) => warn!("failed to fetch features: {}", e),
        }
    }

    let persisted = store::features(config.cache.as_ref()).list();
    if persisted.is_empty() {
        eprintln!("No feature state available: fetch failed and nothing is cached");
        process::exit(1);
    }
    eprintln!("Using cached feature state");
    persisted
}

fn run_features(config: &Config) {
    let snapshot = load_snapshot(config);
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Failed to encode features: {}", e);
            process::exit(1);
        }
    }
}

fn parse_user_id(id: &str) -> UserId {
    match id.parse::<i64>() {
        Ok(n) if !id.starts_with('+') => UserId::Int(n),
        _ => UserId::from(id),
    }
}

fn run_check(
    config: &Config,
    feature: &str,
    user_id: &str,
    version: Option<&str>,
    attr_args: &[String],
) {
    let snapshot = load_snapshot(config);

    let user = attr_args
        .iter()
        .filter_map(|arg| {
            let eq_pos = arg.find('=')?;
            Some((&arg[..eq_pos], &arg[eq_pos + 1..]))
        })
        .fold(User::new(parse_user_id(user_id)), |user, (key, value)| {
            user.cohort_attr(key, value)
        });

    if !snapshot.contains_key(feature) {
        eprintln!("Feature '{}' not found", feature);
        process::exit(1);
    }

    match assign::is_enabled(
        &snapshot,
        feature,
        version,
        user.unique_id(),
        &user.attributes(),
    ) {
        Ok(enabled) => println!("{}", enabled),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

/// Transaction counts of the persisted buckets. Fails, rather than reading as
/// an empty backlog, when the store is locked by a running app.
fn backlog_sizes(cache: &CacheConfig) -> fluidfeatures::Result<Vec<usize>> {
    Ok(SledBuckets::open(&cache.dir, cache.limit)?.sizes())
}

fn run_backlog(config: &Config) {
    let Some(cache) = config.cache.as_ref().filter(|c| c.enable) else {
        eprintln!("Caching is not enabled in this config");
        process::exit(1);
    };
    let sizes = match backlog_sizes(cache) {
        Ok(sizes) => sizes,
        Err(e) => {
            eprintln!("Failed to open backlog in {}: {}", cache.dir.display(), e);
            process::exit(1);
        }
    };
    let total: usize = sizes.iter().sum();
    println!(
        "{} buckets, {} transactions waiting in {}",
        sizes.len(),
        total,
        cache.dir.display()
    );
}

fn main() {
    init_logging();
    let args = Args::parse();
    let config = load_config(&args.config, &args.env);
    match args.cmd {
        Command::Features => run_features(&config),
        Command::Check {
            feature,
            user,
            version,
            attrs,
        } => run_check(&config, &feature, &user, version.as_deref(), &attrs),
        Command::Backlog => run_backlog(&config),
    }
}

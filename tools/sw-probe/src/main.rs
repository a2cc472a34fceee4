//! Probe the Bellari offline worker against a live origin.
//!
//! Cache storage is kept in a state file between runs, so a site can be
//! installed while online and then browsed with the connection dropped.
//!
//! ## Usage
//!
//! ```bash
//! # Register the worker and seed the app shell
//! sw-probe --origin http://localhost:5000/ install
//!
//! # Navigate with the network gone, answered from the cache
//! sw-probe fetch /services --navigate --offline
//!
//! # List buckets and their entries
//! sw-probe caches --json
//! ```

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bellari_common::{
    default_state_file, init_logging, load_json, save_json, BellariError, LogConfig, LogFormat,
};
use bellari_net::{HttpNetwork, LoaderConfig, NetError, Network, Request, Response};
use bellari_sw::{
    CacheBackend, CacheStorage, FetchOutcome, OfflineCacheWorker, RegistrationOptions,
    ServiceWorkerContainer, ServiceWorkerError, ServiceWorkerEvent, WorkerConfig,
};
use clap::{Parser, Subcommand};
use http::Method;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

/// Where the site serves its worker script.
const SCRIPT_PATH: &str = "/static/sw.js";

#[derive(Parser)]
#[command(name = "sw-probe")]
#[command(about = "Drive the Bellari offline worker against a live origin")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Site origin
    #[arg(long, global = true, default_value = "http://localhost:5000/")]
    origin: Url,

    /// Cache storage state file
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Worker config file (JSON); takes precedence over --origin
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the worker, seed its cache and activate it
    Install {
        /// Registration scope, resolved against the script URL
        #[arg(long)]
        scope: Option<String>,
    },

    /// Send one request through the fetch handler
    Fetch {
        /// Path (or absolute URL) to request
        path: String,
        /// Treat the request as a page navigation
        #[arg(long)]
        navigate: bool,
        /// Request method
        #[arg(long, default_value = "GET")]
        method: String,
        /// Fail every network request
        #[arg(long)]
        offline: bool,
    },

    /// List cache buckets and their entries
    Caches {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Network that is never reachable.
struct OfflineNetwork;

#[async_trait]
impl Network for OfflineNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, "Dropping request (offline)");
        Err(NetError::Offline(request.url.to_string()))
    }
}

/// Writes bucket deletions through to the state file as they happen.
#[derive(Debug)]
struct StateFileBackend {
    path: PathBuf,
}

impl CacheBackend for StateFileBackend {
    fn remove(&self, name: &str) -> bellari_sw::Result<()> {
        let to_cache_error = |e: BellariError| ServiceWorkerError::CacheError(e.to_string());

        let Some(mut saved) = load_json::<CacheStorage>(&self.path).map_err(to_cache_error)?
        else {
            return Ok(());
        };
        if saved.delete(name)? {
            save_json(&self.path, &saved).map_err(to_cache_error)?;
            debug!(cache = %name, state = %self.path.display(), "Removed from state file");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_logging(LogConfig::for_verbosity(cli.verbose).with_format(format))?;

    let config = worker_config(cli.config.as_deref(), &cli.origin)?;
    let state = cli.state.clone().unwrap_or_else(default_state_file);
    let storage = load_storage(&state)?;

    match cli.command {
        Commands::Install { scope } => {
            let backend = Arc::new(StateFileBackend {
                path: state.clone(),
            });
            let storage = install(config, storage.with_backend(backend), scope).await?;
            save_json(&state, &storage)?;
            info!(state = %state.display(), "Cache storage saved");
        }

        Commands::Fetch {
            path,
            navigate,
            method,
            offline,
        } => {
            let network: Arc<dyn Network> = if offline {
                Arc::new(OfflineNetwork)
            } else {
                Arc::new(HttpNetwork::new(LoaderConfig::default())?)
            };
            let request = build_request(&config, &path, navigate, &method)?;
            let worker = OfflineCacheWorker::new(config, storage.shared(), network)?;

            match worker.handle_fetch(&request).await? {
                FetchOutcome::Passthrough(reason) => {
                    println!("{} {}: not intercepted ({reason:?})", request.method, request.url);
                }
                FetchOutcome::Respond { response, source } => {
                    println!("{} {}", response.status, response.url);
                    println!("  Source: {source:?}");
                    println!("  Bytes:  {}", response.body.len());
                }
            }
        }

        Commands::Caches { json } => {
            let report = cache_report(&storage);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.is_empty() {
                println!("No caches in {}", state.display());
            } else {
                for cache in &report {
                    println!("{} ({} entries)", cache.name, cache.entries.len());
                    for entry in &cache.entries {
                        println!("  {} {} ({} bytes)", entry.status, entry.url, entry.bytes);
                    }
                }
            }
        }
    }

    Ok(())
}

fn worker_config(path: Option<&Path>, origin: &Url) -> Result<WorkerConfig, BellariError> {
    match path {
        Some(path) => load_json(path)?.ok_or_else(|| {
            BellariError::config(format!("worker config {} not found", path.display()))
        }),
        None => Ok(WorkerConfig::new(origin.clone())),
    }
}

fn load_storage(path: &Path) -> Result<CacheStorage, BellariError> {
    Ok(load_json(path)?.unwrap_or_default())
}

async fn install(
    config: WorkerConfig,
    storage: CacheStorage,
    scope: Option<String>,
) -> Result<CacheStorage, Box<dyn Error>> {
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(LoaderConfig::default())?);
    let caches = storage.shared();
    let (container, mut events) = ServiceWorkerContainer::with_caches(network, Arc::clone(&caches));

    let script = config.origin.join(SCRIPT_PATH)?;
    let registered = container
        .register(script.as_str(), RegistrationOptions { scope }, config)
        .await;

    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    let id = registered?;
    println!("Worker {} activated", id.raw());

    let snapshot = caches.read().await.clone();
    Ok(snapshot)
}

fn build_request(
    config: &WorkerConfig,
    path: &str,
    navigate: bool,
    method: &str,
) -> Result<Request, Box<dyn Error>> {
    let url = config.resolve(path)?;
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())?;
    let request = if navigate {
        Request::navigate(url)
    } else {
        Request::get(url)
    };
    Ok(request.method(method))
}

fn print_event(event: &ServiceWorkerEvent) {
    match event {
        ServiceWorkerEvent::StateChange {
            worker_id,
            new_state,
            ..
        } => println!("  worker {} -> {new_state:?}", worker_id.raw()),
        ServiceWorkerEvent::UpdateFound { registration_scope } => {
            println!("  update found for {registration_scope}")
        }
        ServiceWorkerEvent::ControllerChange { client_id, .. } => {
            println!("  {client_id} now controlled")
        }
        ServiceWorkerEvent::CacheDeleted { name } => println!("  deleted cache {name}"),
    }
}

#[derive(Debug, Serialize)]
struct CacheReport {
    name: String,
    entries: Vec<EntryReport>,
}

#[derive(Debug, Serialize)]
struct EntryReport {
    url: String,
    status: u16,
    bytes: usize,
    cached_at: u64,
}

fn cache_report(storage: &CacheStorage) -> Vec<CacheReport> {
    storage
        .keys()
        .into_iter()
        .filter_map(|name| storage.get(name))
        .map(|cache| {
            let mut entries: Vec<EntryReport> = cache
                .entries()
                .map(|e| EntryReport {
                    url: e.url.clone(),
                    status: e.status,
                    bytes: e.body.len(),
                    cached_at: e.cached_at,
                })
                .collect();
            entries.sort_by(|a, b| a.url.cmp(&b.url));
            CacheReport {
                name: cache.name.clone(),
                entries,
            }
        })
        .collect()
}

use crate::args::{parse_args, CliArgs, CliCommands, OutputFormat};
use futures::{stream, StreamExt};
use object_store::path::Path;
use pageblob::admin;
use pageblob::{
    JsonCodec, PageBlobBackend, PageBlobStore, PrefixKeyResolver, RecordStore, RetrySettings,
    Settings,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod args;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: CliArgs = parse_args();
    let path = Path::from(args.path.as_str());
    let object_store = admin::load_object_store_from_env(args.env_file)?;
    let backend = admin::page_blob_backend(&path, object_store);
    let store = PageBlobStore::builder(backend.clone())
        .with_page_size(args.page_size)
        .build()?;

    match args.command {
        CliCommands::Create { key, pages } => exec_create(&store, &key, pages).await?,
        CliCommands::Info { key } => exec_info(&store, &key).await?,
        CliCommands::List { prefix } => exec_list(&store, &prefix).await?,
        CliCommands::Read {
            key,
            start,
            end,
            format,
        } => exec_read(&store, &key, start, end, format).await?,
        CliCommands::Stress {
            streams,
            appends,
            concurrency,
            max_attempts,
            initial_pages,
            growth_factor,
            min_delay,
            max_delay,
        } => {
            let settings = Settings {
                page_size: args.page_size,
                initial_page_count: initial_pages,
                growth_factor,
                retry: RetrySettings {
                    max_attempts,
                    min_delay,
                    max_delay,
                },
            };
            tokio::select! {
                result = exec_stress(backend, &settings, streams, appends, concurrency) => result?,
                _ = tokio::signal::ctrl_c() => {
                    debug!("intercepted SIGINT ... stopping stress run");
                }
            }
        }
    }

    Ok(())
}

async fn exec_create(store: &PageBlobStore, key: &str, pages: u32) -> Result<(), Box<dyn Error>> {
    let blob = store.create_if_absent(key, pages).await?;
    println!("{}", admin::properties_to_json(blob.key(), blob.properties()));
    Ok(())
}

async fn exec_info(store: &PageBlobStore, key: &str) -> Result<(), Box<dyn Error>> {
    match store.get_existing(key).await? {
        None => println!("no blob found for key {}", key),
        Some(blob) => println!("{}", admin::properties_to_json(blob.key(), blob.properties())),
    }
    Ok(())
}

async fn exec_list(store: &PageBlobStore, prefix: &str) -> Result<(), Box<dyn Error>> {
    for blob in store.list_prefix(prefix).await? {
        println!("{}", admin::properties_to_json(blob.key(), blob.properties()));
    }
    Ok(())
}

async fn exec_read(
    store: &PageBlobStore,
    key: &str,
    start: u64,
    end: Option<u64>,
    format: OutputFormat,
) -> Result<(), Box<dyn Error>> {
    let Some(blob) = store.get_existing(key).await? else {
        println!("no blob found for key {}", key);
        return Ok(());
    };
    let end = end.unwrap_or(blob.size_bytes());
    let bytes = blob.read_range(start, end, false).await?;
    match format {
        OutputFormat::Utf8 => println!("{}", String::from_utf8_lossy(&bytes)),
        OutputFormat::Hex => {
            for (line, chunk) in bytes.chunks(16).enumerate() {
                let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
                println!("{:08x}  {}", start + (line * 16) as u64, hex.join(" "));
            }
        }
    }
    Ok(())
}

/// Mirrors the load driver used to validate the store: many streams, many concurrent
/// appends per stream, retry on every conflict, then check each append landed once.
async fn exec_stress(
    backend: Arc<dyn PageBlobBackend>,
    settings: &Settings,
    streams: usize,
    appends: usize,
    concurrency: usize,
) -> Result<(), Box<dyn Error>> {
    let run_id = Uuid::new_v4();
    let store = Arc::new(RecordStore::<Vec<u64>>::from_settings(
        backend,
        settings,
        Arc::new(JsonCodec),
        Arc::new(PrefixKeyResolver::new(format!("stress-{run_id}"))),
    )?);
    info!(
        "starting stress run [run_id={}, streams={}, appends={}, concurrency={}]",
        run_id, streams, appends, concurrency
    );

    let started = Instant::now();
    let jobs = (0..streams).flat_map(|stream| (0..appends).map(move |append| (stream, append)));
    let failures: Vec<pageblob::Error> = stream::iter(jobs)
        .map(|(stream, append)| {
            let store = store.clone();
            async move {
                store
                    .update(&format!("stream-{stream}"), move |current| {
                        let mut values = current.unwrap_or_default();
                        values.push(append as u64);
                        Ok::<_, Infallible>(values)
                    })
                    .await
            }
        })
        .buffer_unordered(concurrency)
        .filter_map(|result| async move { result.err() })
        .collect()
        .await;
    let elapsed = started.elapsed();
    for failure in &failures {
        warn!("update failed [error={}]", failure);
    }

    let mut invalid_streams = Vec::new();
    for stream in 0..streams {
        let stream_id = format!("stream-{stream}");
        let values = store.read(&stream_id).await?.unwrap_or_default();
        let distinct: BTreeSet<u64> = values.iter().copied().collect();
        let expected: BTreeSet<u64> = (0..appends as u64).collect();
        if values.len() != appends || distinct != expected {
            warn!(
                "stream is missing or duplicating appends [stream={}, values={}, distinct={}]",
                stream_id,
                values.len(),
                distinct.len()
            );
            invalid_streams.push(stream_id);
        }
    }

    let registry = store.page_store().metrics();
    let metrics: serde_json::Map<String, serde_json::Value> = registry
        .names()
        .into_iter()
        .filter_map(|name| registry.lookup(name).map(|stat| (name.to_string(), json!(stat.get()))))
        .collect();
    let updates = streams * appends;
    println!(
        "{}",
        json!({
            "run_id": run_id.to_string(),
            "streams": streams,
            "appends": appends,
            "updates": updates,
            "failed_updates": failures.len(),
            "invalid_streams": invalid_streams,
            "elapsed_ms": elapsed.as_millis() as u64,
            "updates_per_sec": updates_per_sec(updates, elapsed),
            "metrics": metrics,
        })
    );

    if !failures.is_empty() || !invalid_streams.is_empty() {
        return Err(format!(
            "stress run failed [failed_updates={}, invalid_streams={}]",
            failures.len(),
            invalid_streams.len()
        )
        .into());
    }
    Ok(())
}

fn updates_per_sec(updates: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        0.0
    } else {
        updates as f64 / secs
    }
}

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use evq_core::{meta_namespace_key, EventType, KeyFunc, MetaNamespaceKey, WatchEvent};
use evq_kubehub::{ReflectorConfig, ResourceQueue};
use evq_store::EventQueue;
use kube::core::DynamicObject;
use serde::Serialize;
use tokio::signal;
use tokio::time::{interval_at, Instant, Interval};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "evqctl", version, about = "Compressed watch event delivery")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "EVQ_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch a GVK and print the compressed events a controller would receive
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Redeliver every known object as MODIFIED this often (0 disables)
        #[arg(long = "resync-secs", env = "EVQ_RESYNC_SECS", default_value_t = 0)]
        resync_secs: u64,
        /// Label selector passed to the watch
        #[arg(short = 'l', long = "selector", env = "EVQ_LABEL_SELECTOR")]
        labels: Option<String>,
        /// Field selector passed to the watch
        #[arg(long = "field-selector", env = "EVQ_FIELD_SELECTOR")]
        fields: Option<String>,
    },
    /// Feed a recorded JSON-lines watch log through the queue and print what gets delivered
    Replay {
        /// Watch log, one {"type":..,"object":..} per line ("-" for stdin)
        file: PathBuf,
        /// Print only event type and key
        #[arg(long = "key-only", action = ArgAction::SetTrue)]
        key_only: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("EVQ_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("EVQ_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid EVQ_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { gvk, resync_secs, labels, fields } => {
            let config = ReflectorConfig { namespace: cli.namespace, label_selector: labels, field_selector: fields };
            watch(&gvk, config, resync_secs, cli.output).await?;
        }
        Commands::Replay { file, key_only } => {
            let reader: Box<dyn BufRead> = if file.as_os_str() == "-" {
                Box::new(BufReader::new(io::stdin()))
            } else {
                let f = File::open(&file).with_context(|| format!("opening watch log {}", file.display()))?;
                Box::new(BufReader::new(f))
            };
            let printer = Printer { output: cli.output, key_only };
            let delivered = replay(reader, &printer)?;
            info!(delivered, "replay finished");
        }
    }

    Ok(())
}

async fn watch(gvk: &str, config: ReflectorConfig, resync_secs: u64, output: Output) -> Result<()> {
    info!(gvk = %gvk, ns = ?config.namespace, resync_secs, "watch invoked");
    let client = kube::Client::try_default().await.context("building kube client")?;
    let api = evq_kubehub::dynamic_api(client, gvk, config.namespace.as_deref()).await?;
    let queue: Arc<ResourceQueue<DynamicObject>> = Arc::new(evq_kubehub::resource_queue());

    let reflector_handle = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move {
            if let Err(e) = evq_kubehub::run_reflector(api, config, queue).await {
                error!(error = ?e, "reflector failed");
            }
        }
    });

    // Pop blocks, so the consumer gets its own thread.
    let consumer = std::thread::Builder::new()
        .name("evq-consumer".into())
        .spawn({
            let queue = Arc::clone(&queue);
            let printer = Printer { output, key_only: false };
            move || {
                let mut delivered = 0u64;
                while let Some((kind, obj)) = queue.pop() {
                    let key = evq_kubehub::object_key(&obj).unwrap_or_default();
                    let created = obj.metadata.creation_timestamp.as_ref().map(|t| t.0.timestamp());
                    if let Err(e) = printer.print(kind, &key, created, &obj) {
                        error!(error = %e, "failed to print event");
                    }
                    delivered += 1;
                }
                delivered
            }
        })
        .context("spawning consumer thread")?;

    let mut resync = (resync_secs > 0).then(|| {
        let period = Duration::from_secs(resync_secs);
        interval_at(Instant::now() + period, period)
    });
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; cancelling queue");
                break;
            }
            _ = next_tick(&mut resync) => queue.resync(),
        }
    }

    queue.cancel();
    reflector_handle.abort();
    let delivered = consumer.join().map_err(|_| anyhow!("consumer thread panicked"))?;
    warn!(delivered, pending = queue.len(), "watch loop ended (graceful shutdown)");
    Ok(())
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Feed a watch log into a fresh queue, then drain it.
///
/// An event for a key whose deletion is still queued means a consumer must
/// have caught up in between, so everything queued so far is delivered first.
fn replay(reader: impl BufRead, printer: &Printer) -> Result<u64> {
    let queue = EventQueue::new(MetaNamespaceKey);
    let mut delivered = 0u64;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("reading watch log")?;
        if line.trim().is_empty() {
            continue;
        }
        let ev: WatchEvent<serde_json::Value> =
            serde_json::from_str(&line).with_context(|| format!("line {}: not a watch event", idx + 1))?;
        let key = match MetaNamespaceKey.key_of(&ev.object) {
            Ok(key) => key,
            Err(e) => {
                warn!(line = idx + 1, error = %e, "skipping event without a usable key");
                continue;
            }
        };
        if queue.pending_event(&key) == Some(EventType::Deleted) {
            delivered += drain(&queue, printer)?;
        }
        match ev.kind {
            EventType::Added => queue.add(ev.object)?,
            EventType::Modified => queue.update(ev.object)?,
            EventType::Deleted => queue.delete(ev.object)?,
        }
    }
    delivered += drain(&queue, printer)?;
    Ok(delivered)
}

fn drain(queue: &EventQueue<serde_json::Value, MetaNamespaceKey>, printer: &Printer) -> Result<u64> {
    let mut n = 0;
    while let Some((kind, obj)) = queue.try_pop() {
        let key = meta_namespace_key(&obj).unwrap_or_default();
        let created = obj
            .get("metadata")
            .and_then(|m| m.get("creationTimestamp"))
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp());
        printer.print(kind, &key, created, &obj)?;
        n += 1;
    }
    Ok(n)
}

struct Printer {
    output: Output,
    key_only: bool,
}

impl Printer {
    fn print<T: Serialize>(&self, kind: EventType, key: &str, created: Option<i64>, obj: &T) -> Result<()> {
        match (self.output, self.key_only) {
            (Output::Human, true) => println!("{:<9} {}", kind, key),
            (Output::Human, false) => println!("{:<9} {:<48} {}", kind, key, render_age(created.unwrap_or(0))),
            (Output::Json, true) => {
                #[derive(Serialize)]
                struct Row<'a> { #[serde(rename = "type")] kind: EventType, key: &'a str }
                println!("{}", serde_json::to_string(&Row { kind, key })?);
            }
            (Output::Json, false) => println!("{}", serde_json::to_string(&WatchEvent { kind, object: obj })?),
        }
        Ok(())
    }
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let now = chrono::Utc::now().timestamp();
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = r#"
{"type":"ADDED","object":{"metadata":{"name":"foo","namespace":"ns"},"v":10}}
{"type":"DELETED","object":{"metadata":{"name":"foo","namespace":"ns"},"v":10}}
{"type":"ADDED","object":{"metadata":{"name":"zab","namespace":"ns"},"v":30}}
{"type":"MODIFIED","object":{"metadata":{"name":"zab","namespace":"ns"},"v":31}}
{"type":"MODIFIED","object":{"metadata":{"name":"bar"},"v":1}}
{"type":"DELETED","object":{"metadata":{"name":"bar"},"v":2}}
{"type":"ADDED","object":{"metadata":{},"v":0}}
"#;

    fn printer() -> Printer {
        Printer { output: Output::Json, key_only: true }
    }

    #[test]
    fn replay_delivers_compressed_events() {
        assert_eq!(replay(LOG.as_bytes(), &printer()).unwrap(), 2);
    }

    #[test]
    fn replay_flushes_before_recreating_a_deleted_key() {
        let log = r#"{"type":"MODIFIED","object":{"metadata":{"name":"a"}}}
{"type":"DELETED","object":{"metadata":{"name":"a"}}}
{"type":"ADDED","object":{"metadata":{"name":"a"}}}"#;
        assert_eq!(replay(log.as_bytes(), &printer()).unwrap(), 2);
    }

    #[test]
    fn replay_reports_malformed_lines() {
        let err = replay("{\"type\":\"ADDED\"".as_bytes(), &printer()).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn ages() {
        assert_eq!(render_age(0), "-");
        let now = chrono::Utc::now().timestamp();
        assert_eq!(render_age(now - 90_000), "1d1h");
        assert_eq!(render_age(now - 3_700), "1h1m");
    }
}

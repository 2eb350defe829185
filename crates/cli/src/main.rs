use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kblocks_core::{latest_cursor, position_from_cursor, Cursor, Event, ObjUri, Settings};
use kblocks_fanout::{ChannelSink, EventSink, FanOut};
use kblocks_store::{LogNode, LogTree, ResourceEntry, Session, SessionOptions};
use kblocks_stream::{read_latest_page, read_page, shutdown_flag, Consumer, ReadSpec, RedisHistory, RedisStream};
use metrics::counter;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kblocksctl", version, about = "kblocks event pipeline CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Redis URL (default: KBLOCKS_REDIS_URL or redis://127.0.0.1:6379)
    #[arg(long = "redis-url", global = true)]
    redis_url: Option<String>,

    /// Page size for history reads (default: KBLOCKS_PAGE_SIZE or 100)
    #[arg(long = "page-size", global = true)]
    page_size: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow the shared event stream and print every event
    Consume {
        /// Stream key (default: KBLOCKS_EVENTS_STREAM)
        #[arg(long = "stream")]
        stream: Option<String>,
        /// Consumer group (default: KBLOCKS_CONSUMER_GROUP)
        #[arg(long = "group")]
        group: Option<String>,
        /// Consumer name (default: KBLOCKS_CONSUMER_NAME or a fresh one)
        #[arg(long = "consumer")]
        consumer: Option<String>,
        /// Read block time in ms; 0 blocks until an entry arrives
        #[arg(long = "block-ms")]
        block_ms: Option<u64>,
        /// Prime the session with a cluster list of this GVK first
        #[arg(long = "prime")]
        prime: Option<String>,
        /// Namespace for --prime
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
    /// Read one page of an object's history
    History {
        /// Object URI, e.g. kblocks://acme.com/v1/queues/dev/default/orders
        obj_uri: String,
        /// Page number (default: most recent page)
        #[arg(long = "page", requires = "offset")]
        page: Option<u64>,
        /// Offset of the page (with --page)
        #[arg(long = "offset", requires = "page")]
        offset: Option<u64>,
        /// Nest log events by parent instead of listing them flat
        #[arg(long = "tree", action = ArgAction::SetTrue)]
        tree: bool,
    },
    /// Show the latest-page cursor and its index range for a list length
    Cursor {
        #[arg(long = "total")]
        total: u64,
    },
    /// Discover served resources (incl. CRDs)
    Discover,
    /// List a GVK from the cluster into a session and print the resulting state
    Prime {
        /// GVK key, e.g. "v1/ConfigMap" or "acme.com/v1/Queue"
        gvk: String,
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KBLOCKS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KBLOCKS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KBLOCKS_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(url) = cli.redis_url.clone() {
        settings.redis_url = url;
    }
    if let Some(ps) = cli.page_size.filter(|n| *n > 0) {
        settings.page_size = ps;
    }

    match cli.command {
        Commands::Consume { stream, group, consumer, block_ms, prime, namespace } => {
            if let Some(v) = stream { settings.events_stream = v; }
            if let Some(v) = group { settings.consumer_group = v; }
            if let Some(v) = consumer { settings.consumer_name = v; }
            if let Some(v) = block_ms { settings.block_ms = v; }
            consume(cli.output, &settings, prime.as_deref(), namespace.as_deref()).await?;
        }
        Commands::History { obj_uri, page, offset, tree } => {
            let uri = ObjUri::from_str(&obj_uri).with_context(|| format!("parsing object uri {}", obj_uri))?;
            let key = settings.history_key(&uri.to_string());
            info!(key = %key, page = ?page, offset = ?offset, "history invoked");
            let store = RedisHistory::new(kblocks_stream::redis_log::connect(&settings.redis_url).await?);
            let result = match (page, offset) {
                (Some(page), Some(offset)) => read_page(&store, &key, Cursor { page, offset }, settings.page_size).await?,
                _ => read_latest_page(&store, &key, settings.page_size).await?,
            };
            if result.skipped > 0 {
                warn!(skipped = result.skipped, "history: some stored items could not be decoded");
            }
            if tree {
                let forest = log_forest(&result.events);
                match cli.output {
                    Output::Human => print_forest(&forest, 0),
                    _ => emit(cli.output, &forest)?,
                }
            } else {
                match cli.output {
                    Output::Human => {
                        let range = result.position.map(|p| format!("{}..={}", p.start, p.end)).unwrap_or_else(|| "-".to_string());
                        println!("page {} • offset {} • total {} • range {}", result.cursor.page, result.cursor.offset, result.total, range);
                        for ev in &result.events {
                            println!("{}", render_event(ev));
                        }
                    }
                    _ => emit(cli.output, &result)?,
                }
            }
        }
        Commands::Cursor { total } => {
            let cursor = latest_cursor(total, settings.page_size);
            let position = position_from_cursor(cursor, settings.page_size);
            #[derive(Serialize)]
            struct Row { total: u64, page_size: u64, cursor: Cursor, position: kblocks_core::Position, within: Option<kblocks_core::Position> }
            let row = Row { total, page_size: settings.page_size, cursor, position, within: position.within(total) };
            match cli.output {
                Output::Human => println!(
                    "page {} offset {} → {}..={} (in list: {})",
                    cursor.page,
                    cursor.offset,
                    position.start,
                    position.end,
                    row.within.map(|p| format!("{}..={}", p.start, p.end)).unwrap_or_else(|| "-".to_string())
                ),
                _ => emit(cli.output, &row)?,
            }
        }
        Commands::Discover => {
            info!("discover invoked");
            match kblocks_kubehub::discover().await {
                Ok(resources) => match cli.output {
                    Output::Human => {
                        for r in resources {
                            let scope = if r.namespaced { "namespaced" } else { "cluster" };
                            let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                            println!("{} • {} • {} • {}", gv, r.kind, r.plural, scope);
                        }
                    }
                    _ => emit(cli.output, &resources)?,
                },
                Err(e) => {
                    error!(error = ?e, "discover failed");
                    eprintln!("discover error: {}", e);
                }
            }
        }
        Commands::Prime { gvk, namespace } => {
            let ns = namespace.as_deref();
            info!(gvk = %gvk, ns = ?ns, "prime invoked");
            let (session, handle) = Session::new(session_options(&settings));
            let events = kblocks_kubehub::list_sync_events(&gvk, ns, &settings.system_id).await?;
            session.prime(events.iter());
            let snap = handle.current();
            let entries: Vec<&ResourceEntry> = snap.resources.values().map(|e| e.as_ref()).collect();
            match cli.output {
                Output::Human => print_resources(&entries),
                _ => emit(cli.output, &entries)?,
            }
        }
    }

    Ok(())
}

fn session_options(settings: &Settings) -> SessionOptions {
    SessionOptions { orphan_grace: Duration::from_millis(settings.orphan_grace_ms), ..SessionOptions::default() }
}

async fn consume(output: Output, settings: &Settings, prime: Option<&str>, ns: Option<&str>) -> Result<()> {
    info!(stream = %settings.events_stream, group = %settings.consumer_group, consumer = %settings.consumer_name, "consume invoked");
    let (session, handle) = Session::new(session_options(settings));
    if let Some(gvk) = prime {
        match kblocks_kubehub::list_sync_events(gvk, ns, &settings.system_id).await {
            Ok(events) => {
                session.prime(events.iter());
            }
            Err(e) => warn!(gvk = %gvk, error = ?e, "prime failed; continuing with live events only"),
        }
    }

    let fanout = Arc::new(FanOut::new());
    fanout.register("session", Arc::clone(&session) as Arc<dyn EventSink>);
    let (tap, mut tap_rx) = ChannelSink::new(settings.queue_cap);
    fanout.register("printer", Arc::new(tap));

    let log = RedisStream::connect(&settings.redis_url, settings.events_stream.clone()).await?;
    let spec = ReadSpec::new(settings.consumer_group.clone(), settings.consumer_name.clone()).with_block_ms(settings.block_ms);
    let consumer = Consumer::new(log, spec).with_backoff_max(Duration::from_secs(settings.read_backoff_max_secs));
    let (stop_tx, stop_rx) = shutdown_flag();
    let mut task = tokio::spawn({
        let fanout = Arc::clone(&fanout);
        async move { consumer.run(fanout.as_ref(), stop_rx).await }
    });

    let finished = loop {
        tokio::select! {
            maybe = tap_rx.recv() => match maybe {
                Some(ev) => {
                    counter!("cli_events_printed_total", 1u64);
                    print_event(output, &ev)?;
                }
                None => break None,
            },
            done = &mut task => break Some(done),
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping consumer");
                break None;
            }
        }
    };

    let _ = stop_tx.send(true);
    let done = match finished {
        Some(done) => Some(done),
        // A blocking read only observes the flag once it returns.
        None => match tokio::time::timeout(Duration::from_secs(2), &mut task).await {
            Ok(done) => Some(done),
            Err(_) => {
                task.abort();
                warn!("consumer still blocked in read; aborted");
                None
            }
        },
    };
    match done {
        Some(Ok(Ok(stats))) => info!(entries = stats.entries, handled = stats.handled, decode_errors = stats.decode_errors, "consumer finished"),
        Some(Ok(Err(e))) => return Err(e).context("consumer failed"),
        Some(Err(e)) => error!(error = %e, "consumer task panicked"),
        None => {}
    }
    let snap = handle.current();
    info!(epoch = snap.epoch, resources = snap.len(), "session closed");
    Ok(())
}

fn emit<T: Serialize + ?Sized>(output: Output, value: &T) -> Result<()> {
    match output {
        Output::Yaml => print!("---\n{}", serde_yaml::to_string(value)?),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn print_event(output: Output, ev: &Event) -> Result<()> {
    match output {
        Output::Human => println!("{}", render_event(ev)),
        // one event per line so the stream can be piped
        Output::Json => println!("{}", ev.to_json()?),
        Output::Yaml => emit(output, ev)?,
    }
    Ok(())
}

fn render_event(ev: &Event) -> String {
    let detail = match ev {
        Event::Object(o) => format!("{:?}", o.reason).to_uppercase(),
        Event::Lifecycle(l) => format!("{} {}: {}", l.event.kind, l.event.reason, l.event.message),
        Event::Log(l) => format!("{} {}", l.level.as_str(), l.message),
        Event::Error(e) => e.message.clone(),
    };
    format!("{} {:<9} {} {}", ev.timestamp().format("%Y-%m-%dT%H:%M:%S%.3fZ"), ev.kind().as_str(), ev.obj_uri(), detail)
}

fn log_forest(events: &[Event]) -> Vec<LogNode> {
    let mut tree = LogTree::new();
    for ev in events {
        if let Event::Log(l) = ev {
            tree.push(l.clone());
        }
    }
    tree.forest()
}

fn print_forest(nodes: &[LogNode], depth: usize) {
    for n in nodes {
        println!("{}{} {}", "  ".repeat(depth), n.event.level.as_str(), n.event.message);
        print_forest(&n.children, depth + 1);
    }
}

fn print_resources(entries: &[&ResourceEntry]) {
    println!("{:<60} {:<8} {:<12} EDGES", "OBJECT", "REASON", "LIFECYCLE");
    for e in entries {
        let reason = e.reason.map(|r| format!("{:?}", r).to_uppercase()).unwrap_or_else(|| "-".to_string());
        let phase = e.lifecycle.as_ref().map(|l| l.phase.reason.clone()).filter(|s| !s.is_empty()).unwrap_or_else(|| "-".to_string());
        println!("{:<60} {:<8} {:<12} {}", e.obj_uri, reason, phase, e.edges.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: serde_json::Value) -> Event { Event::from_json(raw.to_string().as_bytes()).unwrap() }

    fn log(id: &str, parent: Option<&str>, msg: &str) -> Event {
        let mut raw = serde_json::json!({
            "type": "LOG",
            "objUri": "kblocks://acme.com/v1/queues/dev/default/q1",
            "objType": "acme.com/v1/queues",
            "timestamp": "2024-05-01T10:00:00Z",
            "requestId": "r",
            "level": "INFO",
            "message": msg,
            "logId": id,
        });
        if let Some(p) = parent {
            raw["parentLogId"] = serde_json::Value::String(p.to_string());
        }
        parse(raw)
    }

    #[test]
    fn renders_one_line_per_event() {
        let ev = parse(serde_json::json!({
            "type": "OBJECT",
            "objUri": "kblocks://acme.com/v1/queues/dev/default/q1",
            "objType": "acme.com/v1/queues",
            "timestamp": "2024-05-01T10:00:00Z",
            "requestId": "r",
            "object": {},
            "reason": "CREATE",
        }));
        assert_eq!(render_event(&ev), "2024-05-01T10:00:00.000Z OBJECT    kblocks://acme.com/v1/queues/dev/default/q1 CREATE");
        assert!(render_event(&log("1", None, "hello")).ends_with("INFO hello"));
    }

    #[test]
    fn history_tree_nests_logs_and_skips_other_events() {
        let events = vec![log("1", None, "deploy"), log("2", Some("1"), "plan"), log("3", None, "done")];
        let forest = log_forest(&events);
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].children[0].event.message, "plan");
    }

    #[test]
    fn cli_parses_history_paging_flags() {
        let cli = Cli::try_parse_from(["kblocksctl", "-o", "json", "history", "kblocks://a/v1/b/dev/-/n", "--page", "2", "--offset", "14"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::History { page, offset, tree, .. } => {
                assert_eq!((page, offset, tree), (Some(2), Some(14), false));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Cli::try_parse_from(["kblocksctl", "history", "kblocks://a/v1/b/dev/-/n", "--page", "2"]).is_err());
    }
}

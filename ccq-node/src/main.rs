use std::panic;
use std::sync::Arc;

use anyhow::Context;
use backtrace::Backtrace;
use ccq_auth::DigestSigner;
use ccq_node::config::Config;
use ccq_node::config::WatcherKind;
use ccq_node::dispatch::ChainDispatchTable;
use ccq_node::dispatch::ChainQueues;
use ccq_node::handler::QueryHandler;
use ccq_node::handler::QuerySubmitter;
use ccq_node::ingress::route_outcomes;
use ccq_node::ingress::Ingress;
use ccq_node::metrics::Metrics;
use ccq_node::permissions::PermissionTable;
use ccq_node::publisher::ResponseSigner;
use ccq_node::validator::RequestValidator;
use ccq_watchers::ChainWatcher;
use ccq_watchers::DummyWatcher;
use ccq_watchers::WatcherPool;
use clap::Parser;
use mimalloc::MiMalloc;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Clone, Debug)]
struct Cli {
    /// Path to the configuration file.
    #[clap(short, long)]
    config: Option<String>,

    /// If set, output logs in JSON format.
    #[clap(short, long, action)]
    json: bool,
}

fn setup_logging(json: bool) {
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    } else {
        let subscriber = tracing_subscriber::fmt()
            .pretty()
            .compact()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.json);

    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => {
                match panic_info.payload().downcast_ref::<String>() {
                    Some(s) => &s[..],
                    None => "Box<dyn Any>",
                }
            },
        };
        let (file, lineno, col) = match panic_info.location() {
            Some(l) => (l.file(), l.line(), l.column()),
            None => ("<unknown>", 0, 0),
        };

        error!(
            msg,
            file,
            lineno,
            col,
            "Panic occurred: {:?}",
            Backtrace::new(),
        );
    }));

    if let Err(err) = run(cli).await {
        panic!("Guardian exited due to an error: {err:?}")
    } else {
        Ok(())
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    info!("Starting guardian. version: {}", version);
    let config = Config::load(cli.config)?;
    config.validate();
    debug!("Loaded configuration: {:?}", config);

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.prometheus.port))
        .install()
        .context("setting up Prometheus")?;

    run_guardian(&config).await
}

async fn run_guardian(config: &Config) -> anyhow::Result<()> {
    let permissions = Arc::new(
        PermissionTable::load(&config.permissions.file).context("loading permissions")?,
    );

    let guardian_key = match &config.node.guardian_private_key {
        Some(key) => {
            DigestSigner::from_hex(key.expose_secret()).context("parsing guardian private key")?
        },
        None => {
            warn!("No guardian key configured, using an ephemeral key");
            DigestSigner::random()
        },
    };
    let co_signer = config
        .node
        .signer_private_key
        .as_ref()
        .map(|key| DigestSigner::from_hex(key.expose_secret()))
        .transpose()
        .context("parsing signer private key")?;
    let allowed_requesters = config.node.allowed_requesters()?;
    info!(
        environment = %config.node.environment,
        guardian = %guardian_key.address(),
        co_signer = ?co_signer.as_ref().map(DigestSigner::address),
        allowed_requesters = allowed_requesters.as_ref().map_or(0, |r| r.len()),
        "Loaded keys"
    );

    // Worker pools, one per enabled chain
    let dispatch = Arc::new(ChainDispatchTable::from_config(&config.chains));
    let (responses_tx, responses_rx) = mpsc::channel(config.query.response_channel_size);
    let mut queues = ChainQueues::new();
    let mut pools = Vec::new();
    for route in dispatch.enabled_routes() {
        let Some(chain) = config.chains.iter().find(|c| c.chain_id == route.chain_id) else {
            continue;
        };
        let watcher: Arc<dyn ChainWatcher> = match chain.watcher {
            WatcherKind::Dummy => Arc::new(DummyWatcher::new(chain.chain_id)),
        };
        let (pool, queue) = WatcherPool::spawn(
            watcher,
            route.num_workers,
            config.query.chain_queue_size,
            responses_tx.clone(),
        );
        queues.insert(route.chain_id, queue);
        pools.push(pool);
    }
    drop(responses_tx);

    // Query handler and outcome routing
    let (requests_tx, requests_rx) = mpsc::channel(config.query.request_channel_size);
    let (outcomes_tx, outcomes_rx) = mpsc::channel(config.query.outcome_channel_size);
    let handler = QueryHandler::new(
        (&config.query).into(),
        Arc::clone(&dispatch),
        queues,
        ResponseSigner::new(guardian_key),
        requests_rx,
        responses_rx,
        outcomes_tx,
    );
    let handler = tokio::spawn(handler.run());

    let validator = RequestValidator::new(
        config.node.environment,
        permissions,
        co_signer,
        allowed_requesters,
        Metrics::new(),
    );
    let ingress = Ingress::new(
        validator,
        QuerySubmitter::new(dispatch, requests_tx),
        config.http.response_timeout(),
    );
    let router = tokio::spawn(route_outcomes(outcomes_rx, ingress.waiters()));

    let (addr, server) = warp::serve(ingress.routes())
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], config.http.port), async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for the shutdown signal: {err:?}");
            }
            info!("Shutting down");
        })
        .context("binding HTTP server")?;
    info!("Listening on {}", addr);
    server.await;

    // The server owned the last request sender, so the handler now drains
    // and drops the chain queues, which stops the workers.
    handler.await.context("query handler task failed")?;
    for pool in pools {
        pool.join().await;
    }
    router.await.context("outcome router task failed")?;

    info!("Guardian stopped");
    Ok(())
}

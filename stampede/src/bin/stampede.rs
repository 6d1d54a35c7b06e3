use std::{
    env,
    fmt::{self, Display},
    io::Read,
    net::SocketAddr,
    num::NonZeroU32,
    path::PathBuf,
    process,
    str::FromStr,
    time::Duration,
};

use clap::{ArgGroup, Args, Parser, Subcommand};
use http::Uri;
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use rustc_hash::FxHashMap;
use stampede::{
    blackhole::{self, Blackhole},
    config::{Config, Telemetry},
    stats::{Report, Stats},
    swarm::{RunLimits, Swarm},
};
use tokio::{
    runtime::{Builder, Runtime},
    signal,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load stampede config: {0}")]
    Config(#[from] stampede::config::Error),
    #[error("Stampede run failed: {0}")]
    Swarm(#[from] stampede::swarm::Error),
    #[error("Ingest sink failed: {0}")]
    Blackhole(#[from] stampede::blackhole::Error),
    #[error("Failed to encode report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to install prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Could not join the ingest sink task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn default_config_path() -> String {
    "/etc/stampede/stampede.yaml".to_string()
}

#[derive(Default, Clone, Debug)]
struct CliKeyValues {
    inner: FxHashMap<String, String>,
}

impl CliKeyValues {
    #[cfg(test)]
    fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }
}

impl Display for CliKeyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        for (k, v) in &self.inner {
            write!(f, "{k}={v},")?;
        }
        Ok(())
    }
}

impl FromStr for CliKeyValues {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        // Pairs are separated by ',' but a value may itself hold a ','. A
        // segment without '=' continues the value of the pair before it.
        let mut labels = FxHashMap::default();
        let mut last_key: Option<String> = None;

        for segment in input.split(',') {
            if let Some((key, value)) = segment.split_once('=') {
                labels.insert(key.to_string(), value.to_string());
                last_key = Some(key.to_string());
            } else if segment.is_empty() {
                continue;
            } else if let Some(value) = last_key.as_ref().and_then(|k| labels.get_mut(k)) {
                value.push(',');
                value.push_str(segment);
            } else {
                return Err(format!("expected KEY=VALUE, got {segment:?}"));
            }
        }

        Ok(Self { inner: labels })
    }
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a load test with the specified configuration
    Run(Box<RunArgs>),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckArgs),
    /// Serve the ingest sink until interrupted
    Blackhole(BlackholeArgs),
}

#[derive(Args)]
#[clap(group(
     ArgGroup::new("run-time")
           .required(false)
           .args(&["run_time_seconds", "run_time_infinite"]),
))]
struct RunArgs {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// base URI of the target, overrides `target_uri`
    #[clap(long)]
    host: Option<Uri>,
    /// number of simulated users, overrides `users`
    #[clap(long)]
    users: Option<NonZeroU32>,
    /// users started per second, overrides `spawn_rate`
    #[clap(long)]
    spawn_rate: Option<f64>,
    /// the time, in seconds, to run the load test
    #[clap(long, default_value_t = 60)]
    run_time_seconds: u64,
    /// flag to allow infinite run time
    #[clap(long)]
    run_time_infinite: bool,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
    /// socket to bind prometheus exporter to
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
    /// additional labels to apply to all metrics, format KEY=VAL,KEY2=VAL
    #[clap(long)]
    global_labels: Option<CliKeyValues>,
    /// path on disk to write the final report as JSON
    #[clap(long)]
    report_path: Option<PathBuf>,
}

#[derive(Args)]
struct ConfigCheckArgs {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

#[derive(Args)]
struct BlackholeArgs {
    /// address and port to listen on
    #[clap(long, default_value = "0.0.0.0:8080")]
    binding_addr: SocketAddr,
    /// answer every ingest with this status code
    #[clap(long)]
    status: Option<u16>,
    /// delay, in milliseconds, before answering an ingest
    #[clap(long, default_value_t = 0)]
    response_delay_millis: u64,
    /// socket to bind prometheus exporter to
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
}

fn load_config_contents(config_path: &str) -> Result<String, Error> {
    if let Ok(env_var_value) = env::var("STAMPEDE_CONFIG") {
        debug!("Using config from env var 'STAMPEDE_CONFIG'");
        Ok(env_var_value)
    } else {
        debug!("Attempting to open configuration file at: {config_path}");
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .open(config_path)
            .map_err(|err| {
                error!("Could not read config file '{config_path}': {err}");
                err
            })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

fn parse_config(contents: &str) -> Result<Config, Error> {
    Config::from_yaml(contents).map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

fn validate_config(config_path: &str) -> Result<Config, Error> {
    let contents = load_config_contents(config_path)?;
    let config = parse_config(&contents)?;
    info!("Configuration file is valid");
    Ok(config)
}

fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(host) = &args.host {
        config.target_uri = host.clone();
    }
    if let Some(users) = args.users {
        config.users = users;
    }
    if let Some(spawn_rate) = args.spawn_rate {
        config.spawn_rate = spawn_rate;
    }
    if let Some(report_path) = &args.report_path {
        config.stats.report_path = Some(report_path.clone());
    }

    let options_global_labels = args.global_labels.clone().unwrap_or_default();
    if let Some(prometheus_addr) = args.prometheus_addr {
        config.telemetry = Some(Telemetry {
            prometheus_addr,
            global_labels: options_global_labels.inner,
        });
    } else if let Some(telemetry) = config.telemetry.as_mut() {
        for (k, v) in options_global_labels.inner {
            telemetry.global_labels.insert(k, v);
        }
    }
}

fn get_config(args: &RunArgs, config: Option<String>) -> Result<Config, Error> {
    let contents = if let Some(config) = config {
        config
    } else {
        load_config_contents(&args.config_path)?
    };

    let mut config = parse_config(&contents)?;
    apply_overrides(&mut config, args);
    config.validate()?;
    Ok(config)
}

fn install_prometheus(telemetry: &Telemetry) -> Result<(), Error> {
    let mut builder = PrometheusBuilder::new().with_http_listener(telemetry.prometheus_addr);
    for (k, v) in &telemetry.global_labels {
        builder = builder.add_global_label(k, v);
    }
    builder.install()?;
    Ok(())
}

async fn inner_main(config: Config, limits: RunLimits) -> Result<Report, Error> {
    if let Some(telemetry) = &config.telemetry {
        install_prometheus(telemetry)?;
    }

    let (shutdown_watcher, shutdown_broadcast) = stampede_signal::signal();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("received ctrl-c");
                shutdown_broadcast.signal();
            }
            Err(err) => {
                warn!("Unable to listen for ctrl-c: {err}");
                // Dropping the broadcaster would end the run.
                std::future::pending::<()>().await;
            }
        }
    });

    let report_path = config.stats.report_path.clone();
    let swarm = Swarm::new(config, Stats::default(), shutdown_watcher, limits)?;
    let report = swarm.run().await?;

    if let Some(path) = report_path {
        tokio::fs::write(&path, serde_json::to_vec_pretty(&report)?).await?;
        info!("Report written to {}", path.display());
    }
    Ok(report)
}

async fn serve_blackhole(
    config: blackhole::Config,
    telemetry: Option<Telemetry>,
) -> Result<(), Error> {
    if let Some(telemetry) = &telemetry {
        install_prometheus(telemetry)?;
    }

    let (shutdown_watcher, shutdown_broadcast) = stampede_signal::signal();
    let sink = Blackhole::bind(config, shutdown_watcher).await?;
    let server = tokio::spawn(sink.run());

    signal::ctrl_c().await?;
    info!("received ctrl-c");
    shutdown_broadcast.signal_and_wait().await;
    server.await??;
    Ok(())
}

fn runtime() -> Result<Runtime, Error> {
    Ok(Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?)
}

fn run(args: &RunArgs) -> Result<(), Error> {
    let config = get_config(args, None)?;

    let run_time = if args.run_time_infinite {
        None
    } else {
        Some(Duration::from_secs(args.run_time_seconds))
    };
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());
    let limits = RunLimits {
        run_time,
        stop_timeout: max_shutdown_delay,
    };
    let exit_code_on_error = config.stats.exit_code_on_error;

    let runtime = runtime()?;
    let res = runtime.block_on(inner_main(config, limits));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    let report = res?;

    let code = exit_code(&report, exit_code_on_error);
    if code != 0 {
        warn!(
            "{failures} of {requests} requests failed, exiting with {code}",
            failures = report.total.failures,
            requests = report.total.requests,
        );
        process::exit(code);
    }
    info!("Bye. :)");
    Ok(())
}

/// The process exit code for a finished run: `on_error` if any request
/// failed, zero otherwise.
fn exit_code(report: &Report, on_error: i32) -> i32 {
    if report.total.failures > 0 {
        on_error
    } else {
        0
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting stampede {version}.");

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(&args),
        Commands::ConfigCheck(args) => match validate_config(&args.config_path) {
            Ok(_) => process::exit(0),
            Err(_) => process::exit(1),
        },
        Commands::Blackhole(args) => {
            let config = blackhole::Config {
                binding_addr: args.binding_addr,
                status: args.status,
                response_delay_millis: args.response_delay_millis,
                ..blackhole::Config::default()
            };
            let telemetry = args.prometheus_addr.map(|prometheus_addr| Telemetry {
                prometheus_addr,
                global_labels: FxHashMap::default(),
            });
            let runtime = runtime()?;
            let res = runtime.block_on(serve_blackhole(config, telemetry));
            runtime.shutdown_timeout(Duration::from_secs(1));
            res
        }
    }
}

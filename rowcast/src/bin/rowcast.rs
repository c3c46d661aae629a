use std::{
    fmt::{self, Display},
    path::Path,
    str::FromStr,
};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use rowcast::{
    config::{self, Config, Telemetry},
    emulator::Emulator,
};
use rustc_hash::FxHashMap;
use tokio::{
    runtime::Builder,
    signal,
    time::{self, Duration, sleep},
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Rowcast emulator returned an error: {0}")]
    Emulator(#[from] rowcast::emulator::Error),
    #[error("Failed to load rowcast config: {0}")]
    Config(#[from] rowcast::config::Error),
    #[error("Parsing Prometheus address failed: {0}")]
    PrometheusAddr(#[from] std::net::AddrParseError),
    #[error(transparent)]
    Registration(#[from] rowcast_signal::RegisterError),
}

fn default_config_path() -> String {
    "/etc/rowcast/rowcast.yaml".to_string()
}

#[derive(Default, Clone)]
struct CliKeyValues {
    inner: FxHashMap<String, String>,
}

impl CliKeyValues {
    #[cfg(test)]
    fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(|s| s.as_str())
    }
}

impl Display for CliKeyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        for (k, v) in self.inner.iter() {
            write!(f, "{k}={v},")?;
        }
        Ok(())
    }
}

impl FromStr for CliKeyValues {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        // A key always matches `[[:alpha:]_]+` and is always followed by '='
        // and then a value. Pairs are delimited by ',' but ',' is also valid
        // inside a value, so the key pattern is the only reliable delimiter.
        // Split on keys, then tidy up the spans between them into values.
        static RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"([[:alpha:]_]+)=").expect("Invalid regex pattern provided"));

        let mut labels = FxHashMap::default();

        for cap in RE.captures_iter(input) {
            let key = cap[1].to_string();
            let start = cap.get(0).expect("value 0 not found in Captures").end();

            // Find the next key or run into the end of the input.
            let end = RE.find_at(input, start).map_or(input.len(), |m| m.start());

            // Extract the value.
            let value = input[start..end].trim_end_matches(',').to_string();

            labels.insert(key, value);
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
    /// Run the emulator with the specified configuration
    Run(RunCommand),
    /// Validate the configuration file and exit
    ConfigCheck(ConfigCheckCommand),
    /// Publish one record per stream, report the outcome and exit
    Probe(ProbeCommand),
}

#[derive(Args)]
struct RunCommand {
    #[command(flatten)]
    args: RunArgs,
}

#[derive(clap::Args)]
struct RunArgs {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// additional labels to apply to all metrics, format KEY=VAL,KEY2=VAL
    #[clap(long)]
    global_labels: Option<CliKeyValues>,
    /// address to bind the prometheus exporter to, overrides the telemetry
    /// section of the configuration
    #[clap(long)]
    prometheus_addr: Option<String>,
    /// the time, in seconds, to run the emulation; omit to run until ctrl-c
    #[clap(long)]
    duration_seconds: Option<u32>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

#[derive(Args)]
struct ProbeCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn get_config(args: &RunArgs) -> Result<Config, Error> {
    let mut config = config::load_config(Path::new(&args.config_path))?;

    let options_global_labels = args.global_labels.clone().unwrap_or_default();
    if let Some(ref prom_addr) = args.prometheus_addr {
        config.telemetry = Some(Telemetry::Prometheus {
            addr: prom_addr.parse()?,
            global_labels: options_global_labels.inner,
        });
    } else if let Some(Telemetry::Prometheus {
        ref mut global_labels,
        ..
    }) = config.telemetry
    {
        for (k, v) in options_global_labels.inner {
            global_labels.insert(k, v);
        }
    }
    Ok(config)
}

async fn inner_main(experiment_duration: Duration, mut config: Config) -> Result<(), Error> {
    let (shutdown_watcher, shutdown_broadcast) = rowcast_signal::signal();

    // Set up the telemetry sub-system.
    if let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = config.telemetry.take()
    {
        let mut builder = PrometheusBuilder::new().with_http_listener(addr);
        for (k, v) in global_labels {
            builder = builder.add_global_label(k, v);
        }
        tokio::spawn(async move {
            builder
                .install()
                .expect("failed to install prometheus recorder");
        });
    }

    //
    // EMULATOR
    //
    // Registered so that the shutdown broadcast below waits for the loop to
    // wind down.
    let mut esrv_joinset = tokio::task::JoinSet::new();
    let emulator = Emulator::new(config, shutdown_watcher.register()?)?;
    esrv_joinset.spawn(emulator.spin());

    let (timer_watcher, timer_broadcast) = rowcast_signal::signal();
    tokio::spawn(async move {
        sleep(experiment_duration).await;
        info!("run duration exceeded, signaling for shutdown");
        timer_broadcast.signal();
    });

    // Any unused watcher must drop at this point. Below in `signal_and_wait`
    // a remaining watcher derived from `shutdown_watcher` prevents shutdown.
    drop(shutdown_watcher);
    let timer_watcher_wait = timer_watcher.recv();
    tokio::pin!(timer_watcher_wait);
    let mut interval = time::interval(Duration::from_millis(400));
    let res = loop {
        tokio::select! {
            _ = interval.tick() => {
                gauge!("rowcast.running").set(1.0);
            },
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break Ok(());
            },
            _ = &mut timer_watcher_wait => {
                info!("shutdown signal received.");
                break Ok(());
            }
            Some(res) = esrv_joinset.join_next() => {
                match res {
                    Ok(emulator_result) => match emulator_result {
                        Ok(()) => { /* Emulator shut down successfully */ }
                        Err(err) => {
                            error!("Emulator shut down unexpectedly: {err}");
                            break Err(Error::Emulator(err));
                        }
                    }
                    Err(err) => error!("Could not join the spawned emulator task: {err}"),
                }
            },
        }
    };
    shutdown_broadcast.signal_and_wait().await;
    res
}

async fn probe(config: Config) -> Result<(), Error> {
    let (shutdown_watcher, _shutdown_broadcast) = rowcast_signal::signal();
    let emulator = Emulator::new(config, shutdown_watcher)?;
    emulator.probe().await?;
    info!("probe complete, all endpoints answered");
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting rowcast {version} run.");

    let cli = Cli::parse();
    let args = match cli.command {
        Commands::Run(run_cmd) => run_cmd.args,
        Commands::ConfigCheck(cmd) => match config::load_config(Path::new(&cmd.config_path)) {
            Ok(_) => {
                info!("Configuration file is valid");
                std::process::exit(0);
            }
            Err(err) => {
                error!("Configuration validation failed: {err}");
                std::process::exit(1);
            }
        },
        Commands::Probe(cmd) => {
            let config = config::load_config(Path::new(&cmd.config_path))?;
            let runtime = Builder::new_multi_thread()
                .enable_io()
                .enable_time()
                .build()?;
            return runtime.block_on(probe(config));
        }
    };

    let config = get_config(&args)?;
    let experiment_duration = args
        .duration_seconds
        .map_or(Duration::MAX, |seconds| Duration::from_secs(seconds.into()));
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(experiment_duration, config));
    // In-flight queries and requests may outlive the select loop. Bound how
    // long we wait for them to wind down.
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye.");
    res
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL_CONFIG: &str = r"
seed: [0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0]
database:
  dsn: mysql://tester@127.0.0.1:3306/activity
streams:
  pin:
    table: pinterest_data
    target_uri: http://127.0.0.1:8082/topics/demo.pin
  geo:
    table: geolocation_data
    target_uri: http://127.0.0.1:8082/topics/demo.geo
  user:
    table: user_data
    target_uri: http://127.0.0.1:8082/topics/demo.user
";

    #[test]
    fn cli_key_values_deserializes_empty_string_to_empty_set() {
        let val = "";
        let deser = CliKeyValues::from_str(val);
        let deser = deser
            .expect("String could not be converted into valid CliKeyValues")
            .to_string();
        assert_eq!("", deser);
    }

    #[test]
    fn cli_key_values_deserializes_kv_list() {
        let val = "deployment=staging,region=antarctica";
        let deser =
            CliKeyValues::from_str(val).expect("String cannot be converted into CliKeyValues");

        assert_eq!(
            deser
                .get("deployment")
                .expect("Deser does not have key deployment"),
            "staging"
        );
        assert_eq!(
            deser.get("region").expect("Deser does not have key region"),
            "antarctica"
        );
    }

    #[test]
    fn cli_key_values_deserializes_trailing_comma_kv_list() {
        let val = "deployment=staging,";
        let deser =
            CliKeyValues::from_str(val).expect("String cannot be converted into CliKeyValues");

        assert_eq!(
            deser
                .get("deployment")
                .expect("Deser does not have key deployment"),
            "staging"
        );
    }

    #[test]
    fn cli_key_values_keeps_commas_inside_values() {
        let val = "zones=a,b,deployment=staging";
        let deser =
            CliKeyValues::from_str(val).expect("String cannot be converted into CliKeyValues");

        assert_eq!(
            deser.get("zones").expect("Deser does not have key zones"),
            "a,b"
        );
        assert_eq!(
            deser
                .get("deployment")
                .expect("Deser does not have key deployment"),
            "staging"
        );
    }

    #[test]
    fn get_config_applies_prometheus_override() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file creates");
        file.write_all(MINIMAL_CONFIG.as_bytes())
            .expect("config writes");
        let config_arg = format!("--config-path={}", file.path().display());

        let cli = Cli::parse_from([
            "rowcast",
            "run",
            config_arg.as_str(),
            "--prometheus-addr=127.0.0.1:9001",
            "--global-labels=deployment=staging",
        ]);
        let Commands::Run(run_cmd) = cli.command else {
            panic!("run subcommand expected");
        };

        let config = get_config(&run_cmd.args).expect("config loads");
        let Some(Telemetry::Prometheus {
            addr,
            global_labels,
        }) = config.telemetry
        else {
            panic!("prometheus telemetry expected");
        };
        assert_eq!(addr, "127.0.0.1:9001".parse().expect("socket addr"));
        assert_eq!(
            global_labels.get("deployment").map(String::as_str),
            Some("staging")
        );
    }

    #[test]
    fn get_config_merges_labels_into_existing_telemetry() {
        let contents = format!(
            "{MINIMAL_CONFIG}
telemetry:
  addr: \"0.0.0.0:9000\"
  global_labels:
    deployment: staging
"
        );
        let mut file = tempfile::NamedTempFile::new().expect("temp file creates");
        file.write_all(contents.as_bytes()).expect("config writes");
        let config_arg = format!("--config-path={}", file.path().display());

        let cli = Cli::parse_from([
            "rowcast",
            "run",
            config_arg.as_str(),
            "--global-labels=region=antarctica",
        ]);
        let Commands::Run(run_cmd) = cli.command else {
            panic!("run subcommand expected");
        };

        let config = get_config(&run_cmd.args).expect("config loads");
        let Some(Telemetry::Prometheus { global_labels, .. }) = config.telemetry else {
            panic!("prometheus telemetry expected");
        };
        assert_eq!(
            global_labels.get("deployment").map(String::as_str),
            Some("staging")
        );
        assert_eq!(
            global_labels.get("region").map(String::as_str),
            Some("antarctica")
        );
    }
}

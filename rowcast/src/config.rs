//! Configuration parsing for the end user, a convenience for the rest of the
//! program. Bad operator input should fail here, at load time, and nowhere
//! deeper.

use std::{env, fs, net::SocketAddr, path::Path};

use http::Uri;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{publisher, sampler};

/// Environment variable that may carry a complete configuration document.
/// When set, the file on disk is not consulted.
pub const CONFIG_VAR: &str = "ROWCAST_CONFIG";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`]
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// The configuration file could not be read
    #[error("Failed to read configuration at {path}: {source}")]
    ReadFile {
        /// Path of the configuration file
        path: String,
        /// The underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
}

fn default_maximum_pause_millis() -> u64 {
    2_000
}

fn default_recount_interval() -> u64 {
    1_024
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The seed for random operations against this target
    pub seed: [u8; 32],
    /// The database the record streams are read from
    pub database: sampler::Config,
    /// The three record streams and where they publish to
    pub streams: Streams,
    /// Exclusive upper bound in milliseconds on the random pause taken before
    /// each iteration
    #[serde(default = "default_maximum_pause_millis")]
    pub maximum_pause_millis: u64,
    /// Fixed exclusive upper bound on sampling offsets. Omit to size the
    /// bound from the tables' row counts.
    #[serde(default)]
    pub maximum_offset: Option<u64>,
    /// Iterations between row count refreshes, when the offset bound is
    /// count-sized
    #[serde(default = "default_recount_interval")]
    pub recount_interval: u64,
    /// The publisher's HTTP behavior
    #[serde(default)]
    pub publisher: publisher::Config,
    /// The method by which to express telemetry
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
}

/// The three record streams, keyed by destination topic.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Streams {
    /// Stream of post records
    pub pin: Stream,
    /// Stream of geolocation records
    pub geo: Stream,
    /// Stream of user profile records
    pub user: Stream,
}

/// Source table and destination endpoint of one record stream.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Stream {
    /// The table rows are sampled from
    pub table: String,
    /// The URI to POST records to. Must be a valid URI.
    #[serde(with = "http_serde::uri")]
    pub target_uri: Uri,
}

/// Defines the manner of rowcast's telemetry.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(untagged)]
pub enum Telemetry {
    /// In prometheus mode rowcast will emit its internal metrics for scraping
    /// at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

/// Load configuration from the environment or a file.
///
/// A complete document in `ROWCAST_CONFIG` takes precedence over the file at
/// `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the document does not
/// deserialize.
pub fn load_config(path: &Path) -> Result<Config, Error> {
    let contents = if let Ok(env_var_value) = env::var(CONFIG_VAR) {
        debug!("Using config from env var '{CONFIG_VAR}'");
        env_var_value
    } else {
        debug!(
            "Attempting to open configuration file at: {}",
            path.display()
        );
        fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.display().to_string(),
            source: Box::new(source),
        })?
    };
    Ok(serde_yaml::from_str(&contents)?)
}

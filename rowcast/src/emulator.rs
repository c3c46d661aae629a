//! The user activity emulator.
//!
//! One iteration of the driver loop looks like a person acting: pause a
//! moment, pick a stored action at random, replay it. Concretely the loop
//! sleeps, draws one offset shared by all three tables, fetches the row at
//! that offset from each table and posts each row to its topic endpoint.
//!
//! ## Metrics
//!
//! `iterations`: Driver loop iterations begun
//! `rows_sampled`: Rows fetched from the database
//! `sample_empty`: Iterations skipped because the offset had no row
//! `sample_failure`: Iterations skipped because sampling failed
//!
//! Additional metrics are emitted by the publisher.

use std::time::Duration;

use metrics::counter;
use rand::{Rng, SeedableRng, prelude::StdRng};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, Streams},
    publisher::{Publisher, Topic},
    sampler::{self, Sampler},
};

/// Errors produced by [`Emulator`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`sampler::Error`].
    #[error("Sampler error: {0}")]
    Sampler(#[from] sampler::Error),
    /// Wrapper around [`crate::publisher::Error`].
    #[error("Publisher error: {0}")]
    Publisher(#[from] crate::publisher::Error),
    /// The offset bound admits no rows, by configuration or because a table
    /// is empty.
    #[error("offset bound is zero, no row can be sampled")]
    ZeroOffsetBound,
}

/// The user activity emulator.
///
/// Constructed once from the top-level configuration, then driven by
/// [`Emulator::spin`] until shutdown or run once by [`Emulator::probe`].
#[derive(Debug)]
pub struct Emulator {
    sampler: Sampler,
    publisher: Publisher,
    /// Source tables in publication order, pin then geo then user.
    tables: [String; 3],
    rng: StdRng,
    maximum_pause_millis: u64,
    maximum_offset: Option<u64>,
    recount_interval: u64,
    until_recount: u64,
    counts: Option<[u64; 3]>,
    metric_labels: Vec<(String, String)>,
    shutdown: rowcast_signal::Watcher,
}

impl Emulator {
    /// Create a new [`Emulator`].
    ///
    /// The database pool and HTTP client are built here but no connection is
    /// opened until the emulator runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the database DSN does not parse.
    pub fn new(config: Config, shutdown: rowcast_signal::Watcher) -> Result<Self, Error> {
        let rng = StdRng::from_seed(config.seed);
        let sampler = Sampler::new(&config.database)?;
        let publisher = Publisher::new(config.publisher, &config.streams);
        let Streams { pin, geo, user } = config.streams;

        Ok(Self {
            sampler,
            publisher,
            tables: [pin.table, geo.table, user.table],
            rng,
            maximum_pause_millis: config.maximum_pause_millis,
            maximum_offset: config.maximum_offset,
            recount_interval: config.recount_interval,
            until_recount: config.recount_interval,
            counts: None,
            metric_labels: vec![("component".to_string(), "emulator".to_string())],
            shutdown,
        })
    }

    /// Establish the initial offset bound, counting rows if no fixed bound is
    /// configured. Empty tables are fatal here, before the loop begins.
    async fn startup_bound(&mut self) -> Result<u64, Error> {
        if self.maximum_offset.is_none() {
            let counts = fetch_counts(&self.sampler, &self.tables).await?;
            info!(
                "row counts at startup: {pin} pin, {geo} geo, {user} user",
                pin = counts[0],
                geo = counts[1],
                user = counts[2]
            );
            self.counts = Some(counts);
        }
        offset_bound(self.maximum_offset, self.counts).ok_or(Error::ZeroOffsetBound)
    }

    /// Run the emulation loop until the shutdown signal arrives.
    ///
    /// Sampling and publish failures within an iteration are logged and
    /// counted, then the loop moves on. Only startup failures end the run.
    ///
    /// # Errors
    ///
    /// Returns an error if a table is empty or unreachable at startup, if the
    /// configured offset bound is zero or if the pool fails to close.
    pub async fn spin(mut self) -> Result<(), Error> {
        let initial_bound = self.startup_bound().await?;
        info!("emulator running, offset bound {initial_bound}");

        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            let pause = next_pause(&mut self.rng, self.maximum_pause_millis);
            tokio::select! {
                () = sleep(pause) => {
                    counter!("iterations", &self.metric_labels).increment(1);

                    if self.maximum_offset.is_none() {
                        if self.until_recount == 0 {
                            self.until_recount = self.recount_interval;
                            match fetch_counts(&self.sampler, &self.tables).await {
                                Ok(counts) => self.counts = Some(counts),
                                Err(err) => {
                                    warn!("row count refresh failed, keeping previous counts: {err}");
                                }
                            }
                        } else {
                            self.until_recount -= 1;
                        }
                    }

                    let Some(bound) = offset_bound(self.maximum_offset, self.counts) else {
                        warn!("no sampleable rows, skipping iteration");
                        continue;
                    };
                    let offset = self.rng.random_range(0..bound);

                    let [pin_table, geo_table, user_table] = &self.tables;
                    let sampled = tokio::try_join!(
                        self.sampler.sample_at(pin_table, offset),
                        self.sampler.sample_at(geo_table, offset),
                        self.sampler.sample_at(user_table, offset),
                    );
                    match sampled {
                        Ok((pin_record, geo_record, user_record)) => {
                            counter!("rows_sampled", &self.metric_labels).increment(3);
                            let records = [&pin_record, &geo_record, &user_record];
                            for (topic, record) in Topic::ALL.into_iter().zip(records) {
                                match self.publisher.publish(topic, record).await {
                                    Ok(status) => {
                                        debug!("{topic} endpoint answered {status} at offset {offset}");
                                    }
                                    Err(err) => {
                                        warn!("failed to publish {topic} record: {err}");
                                    }
                                }
                            }
                        }
                        Err(err) => match classify_sample_failure(&err, self.maximum_offset) {
                            SampleFailure::Empty { recount } => {
                                counter!("sample_empty", &self.metric_labels).increment(1);
                                warn!("{err}, skipping iteration");
                                if recount {
                                    // Counts are stale. Refresh before the next draw.
                                    self.until_recount = 0;
                                }
                            }
                            SampleFailure::Failed => {
                                counter!("sample_failure", &self.metric_labels).increment(1);
                                warn!("sampling failed: {err}");
                            }
                        },
                    }
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
        self.sampler.close().await?;
        Ok(())
    }

    /// Run a single iteration without pausing: sample one row per table at a
    /// shared offset and publish each record once. Used by the probe
    /// subcommand to vet database and endpoint connectivity end to end.
    ///
    /// # Errors
    ///
    /// Returns the first sampling or publish failure encountered.
    pub async fn probe(mut self) -> Result<(), Error> {
        let bound = self.startup_bound().await?;
        let offset = self.rng.random_range(0..bound);
        info!("probing with offset {offset} of bound {bound}");

        let [pin_table, geo_table, user_table] = &self.tables;
        let (pin_record, geo_record, user_record) = tokio::try_join!(
            self.sampler.sample_at(pin_table, offset),
            self.sampler.sample_at(geo_table, offset),
            self.sampler.sample_at(user_table, offset),
        )?;

        let records = [&pin_record, &geo_record, &user_record];
        for (topic, record) in Topic::ALL.into_iter().zip(records) {
            let status = self.publisher.publish(topic, record).await?;
            info!("{topic} endpoint answered {status}");
        }

        self.sampler.close().await?;
        Ok(())
    }
}

/// Draw the pause taken before an iteration, uniform in `[0, maximum)`.
fn next_pause(rng: &mut StdRng, maximum_pause_millis: u64) -> Duration {
    if maximum_pause_millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.random_range(0..maximum_pause_millis))
}

/// The exclusive upper bound for offset draws. A configured bound wins;
/// otherwise the smallest table sets the bound so one offset is valid for
/// all three. A zero bound admits no draw at all and so becomes `None`.
fn offset_bound(maximum_offset: Option<u64>, counts: Option<[u64; 3]>) -> Option<u64> {
    maximum_offset
        .or_else(|| counts.and_then(|counts| counts.iter().copied().min()))
        .filter(|&bound| bound > 0)
}

/// What the driver loop does about a failed sample draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleFailure {
    /// The offset had no row behind it. The iteration is skipped and, when
    /// `recount` is set, the cached row counts refresh before the next draw.
    Empty {
        /// Whether the bound came from row counts the miss proved stale.
        recount: bool,
    },
    /// The database errored or timed out. The iteration is skipped, nothing
    /// to recount.
    Failed,
}

/// Decide the loop's disposition toward a failed sample draw. An offset with
/// no row behind it is routine under a fixed bound but means shrunken tables
/// under a count-sized one.
fn classify_sample_failure(err: &sampler::Error, maximum_offset: Option<u64>) -> SampleFailure {
    match err {
        sampler::Error::EmptyResult { .. } => SampleFailure::Empty {
            recount: maximum_offset.is_none(),
        },
        _ => SampleFailure::Failed,
    }
}

async fn fetch_counts(
    sampler: &Sampler,
    tables: &[String; 3],
) -> Result<[u64; 3], sampler::Error> {
    let [pin_table, geo_table, user_table] = tables;
    let (pin, geo, user) = tokio::try_join!(
        sampler.count(pin_table),
        sampler.count(geo_table),
        sampler.count(user_table),
    )?;
    Ok([pin, geo, user])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;
    use rand::{SeedableRng, prelude::StdRng};

    use super::{Emulator, Error, SampleFailure, classify_sample_failure, next_pause, offset_bound};
    use crate::{
        config::{Config, Stream, Streams},
        publisher, sampler,
    };

    fn demo_config() -> Config {
        let stream = |topic: &str| Stream {
            table: format!("{topic}_data"),
            target_uri: format!("http://127.0.0.1:8082/topics/demo.{topic}")
                .parse()
                .expect("valid uri"),
        };
        Config {
            seed: [0; 32],
            database: sampler::Config {
                dsn: "mysql://tester@127.0.0.1:3306/activity".to_string(),
                query_timeout_millis: 100,
            },
            streams: Streams {
                pin: stream("pin"),
                geo: stream("geo"),
                user: stream("user"),
            },
            maximum_pause_millis: 60_000,
            maximum_offset: Some(5),
            recount_interval: 16,
            publisher: publisher::Config::default(),
            telemetry: None,
        }
    }

    #[tokio::test]
    async fn zero_offset_bound_is_fatal_at_startup() {
        let (watcher, broadcaster) = rowcast_signal::signal();
        let mut config = demo_config();
        config.maximum_offset = Some(0);

        let emulator = Emulator::new(config, watcher).expect("dsn parses");
        let err = emulator.spin().await.expect_err("bound admits no rows");
        assert!(matches!(err, Error::ZeroOffsetBound));
        broadcaster.signal();
    }

    #[tokio::test]
    async fn spin_exits_promptly_on_shutdown() {
        let (watcher, broadcaster) = rowcast_signal::signal();
        let emulator = Emulator::new(demo_config(), watcher).expect("dsn parses");

        broadcaster.signal();
        tokio::time::timeout(Duration::from_secs(5), emulator.spin())
            .await
            .expect("spin returns once signaled")
            .expect("clean exit");
    }

    #[tokio::test]
    async fn probe_surfaces_startup_failures() {
        // Bind and immediately drop a listener to find a dead port.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind succeeds");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let mut config = demo_config();
        config.database.dsn = format!("mysql://tester@{addr}/activity");
        // Sizing from row counts forces a query at startup.
        config.maximum_offset = None;

        let (watcher, _broadcaster) = rowcast_signal::signal();
        let emulator = Emulator::new(config, watcher).expect("dsn parses");
        let err = emulator.probe().await.expect_err("no database there");
        assert!(matches!(err, Error::Sampler(_)));
    }

    proptest! {
        #[test]
        fn bound_is_minimum_of_counts(
            pin in 1_u64..100_000,
            geo in 1_u64..100_000,
            user in 1_u64..100_000,
        ) {
            prop_assert_eq!(
                offset_bound(None, Some([pin, geo, user])),
                Some(pin.min(geo).min(user))
            );
        }

        #[test]
        fn configured_bound_wins_over_counts(
            bound in 1_u64..100_000,
            pin in 1_u64..100_000,
            geo in 1_u64..100_000,
            user in 1_u64..100_000,
        ) {
            prop_assert_eq!(
                offset_bound(Some(bound), Some([pin, geo, user])),
                Some(bound)
            );
        }

        #[test]
        fn pauses_stay_below_the_maximum(
            seed in any::<[u8; 32]>(),
            maximum in 1_u64..10_000,
        ) {
            let mut rng = StdRng::from_seed(seed);
            for _ in 0..32 {
                prop_assert!(next_pause(&mut rng, maximum) < Duration::from_millis(maximum));
            }
        }
    }

    #[test]
    fn missing_counts_mean_no_bound() {
        assert_eq!(offset_bound(None, None), None);
    }

    #[test]
    fn empty_table_means_no_bound() {
        assert_eq!(offset_bound(None, Some([5, 0, 7])), None);
        assert_eq!(offset_bound(Some(0), Some([5, 3, 7])), None);
    }

    #[test]
    fn zero_pause_is_allowed() {
        let mut rng = StdRng::from_seed([0; 32]);
        assert_eq!(next_pause(&mut rng, 0), Duration::ZERO);
    }

    #[test]
    fn empty_offsets_skip_and_recount_only_when_count_sized() {
        let miss = sampler::Error::EmptyResult {
            table: "pinterest_data".to_string(),
            offset: 10_500,
        };
        assert_eq!(
            classify_sample_failure(&miss, None),
            SampleFailure::Empty { recount: true }
        );
        assert_eq!(
            classify_sample_failure(&miss, Some(11_000)),
            SampleFailure::Empty { recount: false }
        );
    }

    #[test]
    fn database_faults_never_trigger_recounts() {
        let timeout = sampler::Error::Timeout {
            table: "user_data".to_string(),
        };
        assert_eq!(classify_sample_failure(&timeout, None), SampleFailure::Failed);

        let drained = sampler::Error::NoRows {
            table: "geolocation_data".to_string(),
        };
        assert_eq!(classify_sample_failure(&drained, None), SampleFailure::Failed);
    }
}

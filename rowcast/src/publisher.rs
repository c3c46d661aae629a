//! The record publisher, speaking the Kafka REST proxy dialect.
//!
//! Each sampled row is wrapped in the proxy's JSON envelope and POSTed to
//! the topic endpoint configured for its stream. Responses are always read:
//! a status outside the 2xx range is an error to the caller, not a shrug.
//!
//! ## Metrics
//!
//! `requests_sent`: number of requests sent
//! `bytes_written`: total bytes written
//! `request_ok`: successful requests
//! `request_failure`: failed requests
//! `request_timeout`: requests that hit the deadline

use std::{fmt, time::Duration};

use bytes::Bytes;
use http::{
    Method, StatusCode, Uri,
    header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap},
};
use http_body_util::{BodyExt, combinators::BoxBody};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::{config::Streams, sampler::Record};

/// Content type demanded by the ingestion endpoints.
pub const KAFKA_JSON_CONTENT_TYPE: &str = "application/vnd.kafka.json.v2+json";

fn default_request_timeout_millis() -> u64 {
    5_000
}

/// Configuration of the publisher's HTTP behavior.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Deadline in milliseconds applied to each request.
    #[serde(default = "default_request_timeout_millis")]
    pub request_timeout_millis: u64,
    /// Headers to attach to every request, on top of the protocol's content
    /// type.
    #[serde(with = "http_serde::header_map", default)]
    pub headers: HeaderMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_millis: default_request_timeout_millis(),
            headers: HeaderMap::default(),
        }
    }
}

/// The three destination topics, one per record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Post records
    Pin,
    /// Geolocation records
    Geo,
    /// User profile records
    User,
}

impl Topic {
    /// Publication order within one iteration of the driver loop.
    pub const ALL: [Topic; 3] = [Topic::Pin, Topic::Geo, Topic::User];

    /// Short name, used in logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Pin => "pin",
            Topic::Geo => "geo",
            Topic::User => "user",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by [`Publisher`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The endpoint answered outside the 2xx range.
    #[error("{topic} endpoint answered {status}")]
    Status {
        /// Topic whose endpoint was addressed
        topic: Topic,
        /// Status code of the response
        status: StatusCode,
    },
    /// The request could not be sent.
    #[error("Failed to send request to {topic} endpoint: {source}")]
    Request {
        /// Topic whose endpoint was addressed
        topic: Topic,
        /// Underlying client error
        #[source]
        source: Box<hyper_util::client::legacy::Error>,
    },
    /// The request deadline elapsed.
    #[error("Request to {topic} endpoint timed out")]
    Timeout {
        /// Topic whose endpoint was addressed
        topic: Topic,
    },
    /// Wrapper around [`hyper::http::Error`].
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),
    /// Wrapper around [`hyper::Error`].
    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),
    /// Wrapper around [`serde_json::Error`].
    #[error("Failed to serialize record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    records: [EnvelopeRecord<'a>; 1],
}

#[derive(Debug, Serialize)]
struct EnvelopeRecord<'a> {
    value: &'a Record,
}

/// Serialize `record` into the proxy's `{"records":[{"value":...}]}` body.
fn envelope_body(record: &Record) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&Envelope {
        records: [EnvelopeRecord { value: record }],
    })
}

/// Publishes sampled records to the per-topic ingestion endpoints.
pub struct Publisher {
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
    pin_uri: Uri,
    geo_uri: Uri,
    user_uri: Uri,
    headers: HeaderMap,
    request_timeout: Duration,
    metric_labels: Vec<(String, String)>,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("pin_uri", &self.pin_uri)
            .field("geo_uri", &self.geo_uri)
            .field("user_uri", &self.user_uri)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// Create a new [`Publisher`] addressing the endpoints in `streams`.
    #[must_use]
    pub fn new(config: Config, streams: &Streams) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .retry_canceled_requests(false)
            .build_http();

        let metric_labels = vec![("component".to_string(), "publisher".to_string())];

        Self {
            client,
            pin_uri: streams.pin.target_uri.clone(),
            geo_uri: streams.geo.target_uri.clone(),
            user_uri: streams.user.target_uri.clone(),
            headers: config.headers,
            request_timeout: Duration::from_millis(config.request_timeout_millis),
            metric_labels,
        }
    }

    fn target_uri(&self, topic: Topic) -> &Uri {
        match topic {
            Topic::Pin => &self.pin_uri,
            Topic::Geo => &self.geo_uri,
            Topic::User => &self.user_uri,
        }
    }

    /// POST one record to the endpoint of `topic`, returning the response
    /// status. The request deadline covers the whole exchange, response body
    /// included; the body is drained so the connection can return to the
    /// pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the record fails to serialize, the request cannot
    /// be built or sent, the deadline elapses or the endpoint answers outside
    /// the 2xx range.
    pub async fn publish(&self, topic: Topic, record: &Record) -> Result<StatusCode, Error> {
        let body = envelope_body(record)?;
        let body_length = body.len();

        let mut request = http::Request::builder()
            .method(Method::POST)
            .uri(self.target_uri(topic))
            .header(CONTENT_TYPE, KAFKA_JSON_CONTENT_TYPE)
            .header(CONTENT_LENGTH, body_length)
            .body(crate::full(body))?;
        let headers = request.headers_mut();
        for (key, value) in self.headers.clone().drain() {
            if let Some(key) = key {
                headers.insert(key, value);
            }
        }

        let mut labels = self.metric_labels.clone();
        labels.push(("topic".to_string(), topic.as_str().to_string()));
        counter!("requests_sent", &labels).increment(1);

        // One deadline spans the whole exchange, body drain included. An
        // endpoint that answers its headers then stalls the body must not
        // park the loop.
        let work = async {
            let response =
                self.client
                    .request(request)
                    .await
                    .map_err(|source| Error::Request {
                        topic,
                        source: Box::new(source),
                    })?;
            let status = response.status();
            // The body carries nothing rowcast needs but must be read off
            // the wire before the connection can return to the pool.
            let _discarded = response.into_body().collect().await?;
            Ok::<StatusCode, Error>(status)
        };
        let status = match timeout(self.request_timeout, work).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                let mut error_labels = labels.clone();
                error_labels.push(("error".to_string(), err.to_string()));
                counter!("request_failure", &error_labels).increment(1);
                return Err(err);
            }
            Err(_elapsed) => {
                counter!("request_timeout", &labels).increment(1);
                return Err(Error::Timeout { topic });
            }
        };
        counter!("bytes_written", &labels).increment(body_length as u64);

        let mut status_labels = labels.clone();
        status_labels.push(("status_code".to_string(), status.as_u16().to_string()));
        if status.is_success() {
            counter!("request_ok", &status_labels).increment(1);
            Ok(status)
        } else {
            counter!("request_failure", &status_labels).increment(1);
            Err(Error::Status { topic, status })
        }
    }
}

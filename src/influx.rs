use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use influxdb::{InfluxDbWriteable, Query, Timestamp, WriteQuery};
use reqwest::{Client, StatusCode, Url, header};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::InfluxConfig;
use crate::points::{FieldValue, Point};

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Invalid InfluxDB URL: {0}")]
    InvalidUrl(String),
    #[error("Building line protocol failed: {0}")]
    LineProtocol(#[from] influxdb::Error),
    #[error("Compressing write body failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("InfluxDB rejected write with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("Point timestamp {0} ns lies before the epoch")]
    BeforeEpoch(i64),
}

/// Destination for one day's worth of points, written in a single call.
pub trait PointSink {
    async fn write_points(&self, points: &[Point]) -> Result<(), WriteError>;
}

/// Writes gzip-compressed line protocol to the InfluxDB 1.x `/write` endpoint.
pub struct InfluxWriter {
    client: Client,
    write_url: Url,
    database: String,
    username: String,
    password: String,
}

impl InfluxWriter {
    pub fn new(config: &InfluxConfig) -> Result<Self, WriteError> {
        let endpoint = config.endpoint();
        let write_url = Url::parse_with_params(
            &format!("{}/write", endpoint),
            &[("db", config.database.as_str()), ("precision", "ns")],
        )
        .map_err(|e| WriteError::InvalidUrl(format!("{}: {}", endpoint, e)))?;

        // Certificate verification stays at reqwest's default (on).
        let client = Client::builder().gzip(true).build()?;

        Ok(Self {
            client,
            write_url,
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }
}

impl PointSink for InfluxWriter {
    async fn write_points(&self, points: &[Point]) -> Result<(), WriteError> {
        if points.is_empty() {
            debug!("no points to write");
            return Ok(());
        }

        let lines = points
            .iter()
            .map(|p| -> Result<String, WriteError> { Ok(to_write_query(p)?.build()?.get()) })
            .collect::<Result<Vec<_>, _>>()?;
        let body = gzip(lines.join("\n").as_bytes())?;

        let response = self
            .client
            .post(self.write_url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .header(header::CONTENT_ENCODING, "gzip")
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WriteError::Rejected { status, body });
        }

        info!(
            database = %self.database,
            points = points.len(),
            "wrote points"
        );
        Ok(())
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn to_write_query(point: &Point) -> Result<WriteQuery, WriteError> {
    let ns = u128::try_from(point.time_ns).map_err(|_| WriteError::BeforeEpoch(point.time_ns))?;
    let mut query = Timestamp::Nanoseconds(ns).into_query(point.measurement.as_str());

    // Line protocol has no empty tag values; such tags are left off.
    for (name, value) in point.tags.iter().filter(|(_, v)| !v.is_empty()) {
        query = query.add_tag(name.as_str(), value.as_str());
    }
    for (name, value) in &point.fields {
        query = match *value {
            FieldValue::Integer(i) => query.add_field(name.as_str(), i),
            FieldValue::Float(f) => query.add_field(name.as_str(), f),
        };
    }

    Ok(query)
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::types::{CombinedResult, Holding, PortfolioRecord};

/// InfluxDB caps string fields; longer raw reports are cut.
pub const MAX_RAW_CHARS: usize = 65_000;

/// Time-series append endpoint. Writes are best effort.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn write(
        &self,
        series: &str,
        result: &CombinedResult,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

/// InfluxDB v2 writer speaking line protocol over HTTP.
pub struct InfluxSink {
    client: Client,
    endpoint: Url,
    token: String,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, StorageError> {
        let base = config.url.trim_end_matches('/');
        let endpoint = Url::parse_with_params(
            &format!("{base}/api/v2/write"),
            &[
                ("org", config.org.as_str()),
                ("bucket", config.bucket.as_str()),
                ("precision", "ns"),
            ],
        )
        .map_err(|e| StorageError::Endpoint(format!("{}: {e}", config.url)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl StorageSink for InfluxSink {
    async fn write(
        &self,
        series: &str,
        result: &CombinedResult,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let lines = encode(series, result, at);
        if lines.is_empty() {
            debug!("Nothing to write");
            return Ok(());
        }
        for line in &lines {
            debug!("Writing point: {}", truncate_for_log(line));
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(lines.join("\n"))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(points = lines.len(), "Portfolio data written to InfluxDB");
        Ok(())
    }
}

/// Encode a combined result as line-protocol points.
///
/// Raw and structured results are written to separate measurements and
/// never reconciled against each other.
pub fn encode(series: &str, result: &CombinedResult, at: DateTime<Utc>) -> Vec<String> {
    let ts = at.timestamp_nanos_opt().unwrap_or_default();
    let measurement = escape_measurement(series);
    let mut lines = Vec::new();

    if let Some(record) = &result.structured {
        encode_record(&measurement, record, ts, &mut lines);
    }

    if let Some(raw) = &result.raw {
        let text: String = raw.text.chars().take(MAX_RAW_CHARS).collect();
        lines.push(format!(
            "{measurement}_raw,data_type=raw raw_data=\"{}\" {ts}",
            escape_string_field(&text)
        ));
    }

    lines
}

fn encode_record(measurement: &str, record: &PortfolioRecord, ts: i64, lines: &mut Vec<String>) {
    let mut fields = Vec::new();
    if let Some(net_worth) = record.net_worth {
        fields.push(format!("net_worth={}", float(net_worth)));
    }
    if let Some(sol) = record.sol_equivalent {
        fields.push(format!("sol_equivalent={}", float(sol)));
    }
    if !fields.is_empty() {
        lines.push(format!("{measurement} {} {ts}", fields.join(",")));
    }

    for holding in &record.top_assets {
        lines.push(holding_line(measurement, "holding", "asset", holding, ts));
    }
    for platform in &record.top_platforms {
        lines.push(holding_line(measurement, "platform", "platform", platform, ts));
    }
}

fn holding_line(measurement: &str, suffix: &str, tag: &str, holding: &Holding, ts: i64) -> String {
    let mut fields = vec![format!("value={}", float(holding.value))];
    if let Some(pct) = holding.percentage {
        fields.push(format!("percentage={}", float(pct)));
    }
    format!(
        "{measurement}_{suffix},{tag}={} {} {ts}",
        escape_tag(&holding.name),
        fields.join(",")
    )
}

/// Integers without a suffix are floats in line protocol already.
fn float(value: Decimal) -> String {
    value.normalize().to_string()
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_string_field(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn truncate_for_log(line: &str) -> String {
    if line.chars().count() > 200 {
        format!("{}...", line.chars().take(200).collect::<String>())
    } else {
        line.to_string()
    }
}

//! Result records and their row layout.

use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use serde::Deserialize;

/// Columns shared by both header variants, in order.
pub const BASIC_COLUMNS: &[&str] = &[
    "scenario_id",
    "repetition",
    "client_id",
    "num_clients_total",
    "num_servers",
    "num_messages",
    "t_start",
    "t_end",
    "total_elapsed_ms",
    "status",
    "error_detail",
];

/// Basic columns followed by the process metrics.
pub const EXTENDED_COLUMNS: &[&str] = &[
    "scenario_id",
    "repetition",
    "client_id",
    "num_clients_total",
    "num_servers",
    "num_messages",
    "t_start",
    "t_end",
    "total_elapsed_ms",
    "status",
    "error_detail",
    "mem_mb",
    "live_worker_count",
];

/// Which header a result store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HeaderVariant {
    /// Timing and outcome only.
    Basic,
    /// Timing, outcome, memory and live worker count.
    #[default]
    Extended,
}

impl HeaderVariant {
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            HeaderVariant::Basic => BASIC_COLUMNS,
            HeaderVariant::Extended => EXTENDED_COLUMNS,
        }
    }

    /// The header line, including the trailing newline.
    pub fn header_row(&self) -> String {
        let mut row = self.columns().join(",");
        row.push('\n');
        row
    }
}

/// Outcome of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    SendError,
    ReceiveError,
    Mismatch,
    ConnectError,
    ParamError,
    Panic,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::SendError => "send_error",
            Status::ReceiveError => "receive_error",
            Status::Mismatch => "mismatch",
            Status::ConnectError => "connect_error",
            Status::ParamError => "param_error",
            Status::Panic => "panic",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the result store, describing a single worker run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub scenario_id: String,
    pub repetition: u32,
    pub client_id: u64,
    pub num_clients_total: usize,
    pub num_servers: usize,
    pub num_messages: i64,
    pub t_start: DateTime<Utc>,
    pub t_end: DateTime<Utc>,
    pub total_elapsed_ms: f64,
    pub status: Status,
    pub error_detail: String,
    pub mem_mb: f64,
    pub live_worker_count: usize,
}

impl ResultRecord {
    /// Field values in the column order of `variant`'s header.
    pub fn fields(&self, variant: HeaderVariant) -> Vec<String> {
        let mut fields = vec![
            self.scenario_id.clone(),
            self.repetition.to_string(),
            self.client_id.to_string(),
            self.num_clients_total.to_string(),
            self.num_servers.to_string(),
            self.num_messages.to_string(),
            format_timestamp(&self.t_start),
            format_timestamp(&self.t_end),
            format!("{:.2}", self.total_elapsed_ms),
            self.status.to_string(),
            self.error_detail.clone(),
        ];
        if variant == HeaderVariant::Extended {
            fields.push(format!("{:.2}", self.mem_mb));
            fields.push(self.live_worker_count.to_string());
        }
        fields
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

//! Request streams: parsing, replay, and streaming evaluation.
//!
//! The line format is `<client> <timestamp>`, one request per line. Blank
//! lines and lines starting with `#` are ignored.

use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Decision, RateLimiter, RejectReason};

/// A single timestamped request attributed to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub client: String,
    pub timestamp: u64,
}

impl Request {
    pub fn new(client: impl Into<String>, timestamp: u64) -> Self {
        Self {
            client: client.into(),
            timestamp,
        }
    }
}

/// Parse one line. Returns `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str, line_no: usize) -> Result<Option<Request>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut fields = line.split_whitespace();
    let (Some(client), Some(timestamp), None) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(TurnstileError::Input {
            line: line_no,
            message: format!("expected '<client> <timestamp>', got '{}'", line),
        });
    };

    let timestamp = timestamp.parse::<u64>().map_err(|e| TurnstileError::Input {
        line: line_no,
        message: format!("invalid timestamp '{}': {}", timestamp, e),
    })?;

    Ok(Some(Request::new(client, timestamp)))
}

/// Parse a whole request stream, failing on the first malformed line.
pub fn parse_requests(input: &str) -> Result<Vec<Request>> {
    let mut requests = Vec::new();
    for (index, line) in input.lines().enumerate() {
        if let Some(request) = parse_line(line, index + 1)? {
            requests.push(request);
        }
    }
    Ok(requests)
}

/// Evaluate requests in order and return the admit/reject results.
pub fn replay(limiter: &RateLimiter, requests: &[Request]) -> Vec<bool> {
    requests
        .iter()
        .map(|r| limiter.should_allow(&r.client, r.timestamp))
        .collect()
}

/// How decisions are written by [`process_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// `allow <client> <timestamp>` / `deny <client> <timestamp> <reason>`
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Serialize)]
struct DecisionRecord<'a> {
    client: &'a str,
    timestamp: u64,
    allowed: bool,
    decision: &'a Decision,
}

/// Totals for a processed stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub admitted: u64,
    pub rejected: u64,
    pub malformed: u64,
}

/// Render one decision in the requested format, without a trailing newline.
pub fn render(request: &Request, decision: &Decision, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => {
            let record = DecisionRecord {
                client: &request.client,
                timestamp: request.timestamp,
                allowed: decision.is_allowed(),
                decision,
            };
            Ok(serde_json::to_string(&record)?)
        }
        OutputFormat::Text => Ok(match decision {
            Decision::Allowed { .. } => {
                format!("allow {} {}", request.client, request.timestamp)
            }
            Decision::Rejected(rejection) => {
                let reason = match rejection.reason {
                    RejectReason::Cooldown { .. } => "cooldown",
                    RejectReason::OverLimit { .. } => "over_limit",
                    RejectReason::OutOfOrder { .. } => "out_of_order",
                };
                let window = rejection
                    .window
                    .map(|w| format!(" window={}", w))
                    .unwrap_or_default();
                format!(
                    "deny {} {} {}{} retry_at={}",
                    request.client, request.timestamp, reason, window, rejection.retry_at
                )
            }
        }),
    }
}

/// Read requests line by line, evaluate each against `limiter`, and write
/// one decision line per request.
///
/// Malformed lines are logged and skipped; they are not rejections.
pub async fn process_stream<R, W>(
    limiter: &RateLimiter,
    reader: R,
    writer: &mut W,
    format: OutputFormat,
) -> Result<StreamSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut summary = StreamSummary::default();
    let mut lines = reader.lines();
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let request = match parse_line(&line, line_no) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request");
                summary.malformed += 1;
                continue;
            }
        };

        let decision = limiter.check(&request.client, request.timestamp);
        if decision.is_allowed() {
            summary.admitted += 1;
        } else {
            summary.rejected += 1;
        }

        let mut out = render(&request, &decision, format)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }

    writer.flush().await?;
    debug!(
        admitted = summary.admitted,
        rejected = summary.rejected,
        malformed = summary.malformed,
        "Request stream finished"
    );
    Ok(summary)
}

/// Run [`process_stream`] until the input ends or `shutdown` resolves,
/// whichever comes first. Output written so far is flushed either way.
///
/// Returns `None` if the stream was interrupted.
pub async fn process_until<R, W, S>(
    limiter: &RateLimiter,
    reader: R,
    writer: &mut W,
    format: OutputFormat,
    shutdown: S,
) -> Result<Option<StreamSummary>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let outcome = tokio::select! {
        result = process_stream(limiter, reader, &mut *writer, format) => Some(result?),
        _ = shutdown => None,
    };

    writer.flush().await?;
    Ok(outcome)
}

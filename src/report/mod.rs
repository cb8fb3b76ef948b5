//! Console and JSON rendering of a finished run.

use crate::harness::{BenchmarkRun, Observation, Outcome, SummaryStatistics};
use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where and when a run happened.
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub started_at: DateTime<Utc>,
    pub http_url: String,
    pub ws_url: Option<String>,
    pub chain_id: Option<u64>,
    pub sender: Address,
}

/// Everything written to `report.json_path`.
#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub info: &'a RunInfo,
    pub run: &'a BenchmarkRun,
    pub summary: &'a SummaryStatistics,
}

impl<'a> Report<'a> {
    pub fn new(info: &'a RunInfo, run: &'a BenchmarkRun, summary: &'a SummaryStatistics) -> Self {
        Self { info, run, summary }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_console(&mut out);
        out
    }

    pub fn write_json(&self, path: &Path) -> Result<(), ReportError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn write_console(&self, out: &mut String) -> std::fmt::Result {
        let info = self.info;
        writeln!(out, "\n{}", "=".repeat(70))?;
        writeln!(out, "  LATENCY BENCH  {}", info.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(out, "{}", "=".repeat(70))?;
        writeln!(out, "  HTTP endpoint:  {}", info.http_url)?;
        if let Some(ws) = &info.ws_url {
            writeln!(out, "  WS endpoint:    {}", ws)?;
        }
        if let Some(chain_id) = info.chain_id {
            writeln!(out, "  Chain id:       {}", chain_id)?;
        }
        writeln!(out, "  Sender:         {}", info.sender)?;
        writeln!(
            out,
            "  Trials:         {} ({} completed, {} failed)",
            self.run.trials(),
            self.run.results().len(),
            self.run.failures().len()
        )?;

        writeln!(out, "\n## Trials")?;
        for result in self.run.results() {
            let cells: Vec<String> = result
                .observations()
                .iter()
                .map(|o| format!("{}={}", o.strategy, cell(o)))
                .collect();
            writeln!(out, "  #{:<3} {}  tx {}", result.trial, cells.join("  "), result.submission.id)?;
        }
        for failure in self.run.failures() {
            writeln!(out, "  #{:<3} failed: {}", failure.trial, failure.reason)?;
        }

        writeln!(out, "\n## Strategies")?;
        writeln!(
            out,
            "  {:<16} {:<10} {:>5} {:>8} {:>6} {:>12} {:>10} {:>10} {:>10}",
            "strategy", "kind", "hits", "timeouts", "errors", "mean", "min", "median", "max"
        )?;
        for s in &self.summary.strategies {
            writeln!(
                out,
                "  {:<16} {:<10} {:>5} {:>8} {:>6} {:>12} {:>10} {:>10} {:>10}",
                s.strategy,
                s.kind.to_string(),
                format!("{}/{}", s.successes, s.trials),
                s.timeouts,
                s.errors,
                s.mean.to_string(),
                ms(s.min_ms),
                ms(s.median_ms),
                ms(s.max_ms),
            )?;
        }

        if !self.summary.groups.is_empty() {
            writeln!(out, "\n## Grouped averages")?;
            for g in &self.summary.groups {
                writeln!(out, "  {:<10} {:>12}  ({})", g.kind.to_string(), g.mean.to_string(), g.strategies.join(", "))?;
            }
        }

        if let Some(cmp) = &self.summary.comparison {
            writeln!(out, "\n## Comparison")?;
            match (cmp.delta_ms, cmp.percent) {
                (Some(delta), Some(pct)) => writeln!(
                    out,
                    "  {} vs {}: {:+.1}ms ({:+.1}%)",
                    cmp.a, cmp.b, delta, pct
                )?,
                (Some(delta), None) => writeln!(out, "  {} vs {}: {:+.1}ms", cmp.a, cmp.b, delta)?,
                _ => writeln!(out, "  {} vs {}: no data", cmp.a, cmp.b)?,
            }
        }
        Ok(())
    }
}

fn cell(o: &Observation) -> String {
    match &o.outcome {
        Outcome::Detected => format!("{:.0}ms", o.elapsed_ms()),
        Outcome::TimedOut => "timeout".to_string(),
        Outcome::Errored(reason) => format!("error({reason})"),
    }
}

fn ms(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.1}ms")).unwrap_or_else(|| "-".to_string())
}

// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! Prometheus counters/histograms for the indexer, exposed at `GET /metrics`.

use anyhow::Context;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Default size-histogram buckets (bytes), used when `-size-buckets` is not set.
const DEFAULT_SIZE_BUCKETS: &[f64] = &[
    1024.0,
    64.0 * 1024.0,
    1024.0 * 1024.0,
    16.0 * 1024.0 * 1024.0,
    256.0 * 1024.0 * 1024.0,
    1024.0 * 1024.0 * 1024.0,
];

pub struct Metrics {
    registry: Registry,
    pub uploads_total: IntCounter,
    pub upload_errors_total: IntCounter,
    pub analyses_total: IntCounterVec,
    pub cleanups_total: IntCounter,
    pub core_size_bytes: Histogram,
    pub executable_size_bytes: Histogram,
}

impl Metrics {
    pub fn new(size_buckets: &[f64]) -> anyhow::Result<Metrics> {
        let registry = Registry::new();
        let buckets = if size_buckets.is_empty() {
            DEFAULT_SIZE_BUCKETS.to_vec()
        } else {
            size_buckets.to_vec()
        };

        let uploads_total =
            IntCounter::with_opts(Opts::new("rcoredump_uploads_total", "Completed uploads."))?;
        let upload_errors_total = IntCounter::with_opts(Opts::new(
            "rcoredump_upload_errors_total",
            "Uploads that failed before indexing.",
        ))?;
        let analyses_total = IntCounterVec::new(
            Opts::new("rcoredump_analyses_total", "Completed analyses, by outcome."),
            &["outcome"],
        )?;
        let cleanups_total = IntCounter::with_opts(Opts::new(
            "rcoredump_cleanups_total",
            "Cores removed by the cleanup worker.",
        ))?;
        let core_size_bytes = Histogram::with_opts(
            HistogramOpts::new("rcoredump_core_size_bytes", "Size of uploaded cores.")
                .buckets(buckets.clone()),
        )?;
        let executable_size_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "rcoredump_executable_size_bytes",
                "Size of uploaded executables.",
            )
            .buckets(buckets),
        )?;

        registry.register(Box::new(uploads_total.clone()))?;
        registry.register(Box::new(upload_errors_total.clone()))?;
        registry.register(Box::new(analyses_total.clone()))?;
        registry.register(Box::new(cleanups_total.clone()))?;
        registry.register(Box::new(core_size_bytes.clone()))?;
        registry.register(Box::new(executable_size_bytes.clone()))?;

        Ok(Metrics {
            registry,
            uploads_total,
            upload_errors_total,
            analyses_total,
            cleanups_total,
            core_size_bytes,
            executable_size_bytes,
        })
    }

    /// Renders the current values in Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .context("encoding metrics")?;
        Ok(buf)
    }
}

/// Parses the comma-separated `-size-buckets` flag value into bucket bounds.
pub fn parse_size_buckets(s: &str) -> anyhow::Result<Vec<f64>> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().with_context(|| format!("parsing size bucket {s:?}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buckets_string_parses_to_empty_list() {
        assert_eq!(parse_size_buckets("").unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn parses_comma_separated_buckets() {
        assert_eq!(
            parse_size_buckets("1024, 2048,4096").unwrap(),
            vec![1024.0, 2048.0, 4096.0]
        );
    }

    #[test]
    fn metrics_encode_without_error() {
        let metrics = Metrics::new(&[]).unwrap();
        metrics.uploads_total.inc();
        let encoded = metrics.encode().unwrap();
        assert!(String::from_utf8(encoded).unwrap().contains("rcoredump_uploads_total"));
    }
}

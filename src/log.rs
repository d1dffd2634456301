// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! Logging utilities

use std::fmt::Display;
use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

/// Adds a way to log errors to [Result]
pub trait ResultExt {
    /// if `self` is an error, then calls [tracing::warn!] with this error
    ///
    /// otherwise does nothing
    fn or_warn(self);
}

impl<T: Display> ResultExt for Result<(), T> {
    fn or_warn(self) {
        match self {
            Ok(()) => (),
            Err(e) => tracing::warn!("{:#}", e),
        }
    }
}

/// Where log lines should go, selected by the indexer's `-syslog`/`-filelog`
/// flags.
pub enum LogSink {
    Stderr,
    Syslog,
    File(std::path::PathBuf),
}

type SyslogLogger = syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>;

/// Buffers one event's bytes and forwards the full line to syslog on flush.
struct SyslogLineWriter {
    logger: Arc<Mutex<SyslogLogger>>,
    buf: Vec<u8>,
}

impl Write for SyslogLineWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buf.is_empty() {
            let text = String::from_utf8_lossy(&self.buf);
            if let Ok(mut logger) = self.logger.lock() {
                let _ = logger.info(text.trim_end());
            }
            self.buf.clear();
        }
        Ok(())
    }
}

impl Drop for SyslogLineWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[derive(Clone)]
struct SyslogMakeWriter(Arc<Mutex<SyslogLogger>>);

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogLineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogLineWriter {
            logger: self.0.clone(),
            buf: Vec::new(),
        }
    }
}

/// Identifies which of the two binaries is logging to syslog, read from
/// `argv[0]` rather than hardcoded since both `rcoredumpd` and `rcoredump`
/// share this module.
fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "rcoredump".to_string())
}

/// Initializes the global tracing subscriber for the indexer.
///
/// `RUST_LOG` (or the default `rcoredump=info,tower_http=info,warn`) selects
/// verbosity; `sink` selects the destination.
pub fn init(sink: LogSink) -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "rcoredump=info,tower_http=info,warn");
    }
    let filter = EnvFilter::from_default_env();
    match sink {
        LogSink::Stderr => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogSink::Syslog => {
            let formatter = syslog::Formatter3164 {
                facility: syslog::Facility::LOG_DAEMON,
                hostname: None,
                process: process_name(),
                pid: std::process::id() as i32,
            };
            let logger = syslog::unix(formatter).map_err(|e| anyhow::anyhow!("{}", e))?;
            let writer = SyslogMakeWriter(Arc::new(Mutex::new(logger)));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
        }
        LogSink::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| anyhow::anyhow!("opening log file {}: {}", path.display(), e))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .init();
        }
    }
    Ok(())
}

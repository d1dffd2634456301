// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! Indexer configuration: CLI flags, an ini-like config file, and the merge
//! between them (CLI overrides file overrides built-in defaults).
//!
//! The file format is a small `key = value` parser: comments start with `#`,
//! blank lines are skipped, unknown keys are kept around (and simply ignored
//! by [`Config::resolve`]) rather than rejected, so a config file shared
//! across versions degrades gracefully.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;

use crate::log::LogSink;

/// Raw key/value pairs read from an ini-like config file.
pub type FileConfig = HashMap<String, String>;

/// Parses the `key = value` config file format shared by the indexer.
pub fn parse_file_config(text: &str) -> FileConfig {
    let mut result = FileConfig::new();
    for line in text.split('\n') {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(cut) = line.find('=') {
            let key = line[..cut].trim().to_string();
            let value = line[(cut + 1)..].trim().to_string();
            result.insert(key, value);
        }
    }
    result
}

/// CLI flags for `rcoredumpd`, the indexer.
#[derive(Parser, Debug, Clone)]
#[command(name = "rcoredumpd", author, version, about = "Core dump indexer")]
pub struct Cli {
    /// Address to bind the HTTP server to.
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory holding the store, the index, and the analyzer command templates.
    #[arg(long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log to syslog instead of stderr.
    #[arg(long)]
    pub syslog: bool,

    /// Log to this file instead of stderr.
    #[arg(long = "filelog")]
    pub filelog: Option<PathBuf>,

    /// Comma-separated size histogram buckets for size-related metrics.
    #[arg(long = "size-buckets")]
    pub size_buckets: Option<String>,

    /// How long to retain core dumps, e.g. "720h". 0 disables the retention sweep.
    #[arg(long = "retention-duration")]
    pub retention_duration: Option<String>,

    /// Which [`crate::index::Index`] implementation to construct.
    #[arg(long = "index-type")]
    pub index_type: Option<String>,

    /// Which store backend to construct (only "fs" exists today).
    #[arg(long = "store-type")]
    pub store_type: Option<String>,

    /// Command template used to analyze Go binaries.
    #[arg(long = "go.analyzer")]
    pub go_analyzer: Option<String>,

    /// Command template used to analyze C/C++ binaries.
    #[arg(long = "c.analyzer")]
    pub c_analyzer: Option<String>,

    /// Path to an ini-like config file; CLI flags override its values.
    #[arg(long)]
    pub conf: Option<PathBuf>,
}

/// Fully resolved, validated configuration the rest of the indexer runs on.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub data_dir: PathBuf,
    pub log_sink_kind: LogSinkKind,
    pub retention: Option<Duration>,
    pub index_type: String,
    pub store_type: String,
    pub go_analyzer: Vec<String>,
    pub c_analyzer: Vec<String>,
    pub size_buckets: Vec<f64>,
}

#[derive(Debug, Clone)]
pub enum LogSinkKind {
    Stderr,
    Syslog,
    File(PathBuf),
}

impl LogSinkKind {
    pub fn into_sink(self) -> LogSink {
        match self {
            LogSinkKind::Stderr => LogSink::Stderr,
            LogSinkKind::Syslog => LogSink::Syslog,
            LogSinkKind::File(p) => LogSink::File(p),
        }
    }
}

const DEFAULT_BIND: &str = "127.0.0.1:1234";
const DEFAULT_RETENTION: &str = "720h";
const DEFAULT_INDEX_TYPE: &str = "tantivy";
const DEFAULT_STORE_TYPE: &str = "fs";
/// `{Executable}`/`{Core}`/`{DataDir}` are rendered into each token independently.
const DEFAULT_GO_ANALYZER: &str = "dlv exec {Executable} --core {Core} -- -r bt";
const DEFAULT_C_ANALYZER: &str = "gdb --batch -ex bt {Executable} {Core}";

impl Config {
    /// Merges CLI flags over an optional config file over built-in defaults.
    pub fn resolve(cli: Cli) -> anyhow::Result<Config> {
        let file: FileConfig = match &cli.conf {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                parse_file_config(&text)
            }
            None => FileConfig::new(),
        };

        let pick = |cli_val: Option<String>, key: &str, default: &str| -> String {
            cli_val
                .or_else(|| file.get(key).cloned())
                .unwrap_or_else(|| default.to_string())
        };

        let bind = pick(cli.bind.clone(), "bind", DEFAULT_BIND);
        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| file.get("data-dir").map(PathBuf::from))
            .unwrap_or_else(default_data_dir);
        let retention_str = pick(
            cli.retention_duration.clone(),
            "retention-duration",
            DEFAULT_RETENTION,
        );
        let retention = parse_retention(&retention_str)?;
        let index_type = pick(cli.index_type.clone(), "index-type", DEFAULT_INDEX_TYPE);
        let store_type = pick(cli.store_type.clone(), "store-type", DEFAULT_STORE_TYPE);
        let go_analyzer_str = pick(cli.go_analyzer.clone(), "go.analyzer", DEFAULT_GO_ANALYZER);
        let c_analyzer_str = pick(cli.c_analyzer.clone(), "c.analyzer", DEFAULT_C_ANALYZER);
        let size_buckets_str = cli
            .size_buckets
            .clone()
            .or_else(|| file.get("size-buckets").cloned())
            .unwrap_or_default();
        let size_buckets = crate::metrics::parse_size_buckets(&size_buckets_str)?;

        let log_sink_kind = if cli.syslog {
            LogSinkKind::Syslog
        } else if let Some(path) = cli
            .filelog
            .clone()
            .or_else(|| file.get("filelog").map(PathBuf::from))
        {
            LogSinkKind::File(path)
        } else {
            LogSinkKind::Stderr
        };

        Ok(Config {
            bind,
            data_dir,
            log_sink_kind,
            retention,
            index_type,
            store_type,
            go_analyzer: shell_split(&go_analyzer_str),
            c_analyzer: shell_split(&c_analyzer_str),
            size_buckets,
        })
    }
}

/// Falls back to the platform's XDG-style data directory
/// (`~/.local/share/rcoredump` on Linux) when `-data-dir`/the config file
/// don't set one; `./data` if even `$HOME` can't be determined.
fn default_data_dir() -> PathBuf {
    ProjectDirs::from("", "", "rcoredump")
        .map(|dirs| dirs.data_dir().to_owned())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// 0 (or the literal string "0") disables the retention sweep.
fn parse_retention(s: &str) -> anyhow::Result<Option<Duration>> {
    if s.trim() == "0" {
        return Ok(None);
    }
    let d = humantime::parse_duration(s).with_context(|| format!("parsing duration {s:?}"))?;
    Ok(Some(d))
}

/// Splits a command template into argv tokens on whitespace, respecting
/// single/double-quoted groups so a path containing spaces can be quoted in
/// the template. This is the "structured argv template" the design notes
/// recommend in place of a naive whitespace split.
pub fn shell_split(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

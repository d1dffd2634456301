// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! The `rcoredump` CLI: invoked by the kernel's `core_pattern` on each crash,
//! hashes and ships the executable, its core, and its resolved shared
//! libraries to an indexer over HTTP.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use flate2::read::GzEncoder;
use flate2::write::GzEncoder as GzWriter;
use flate2::Compression;
use sha1::{Digest, Sha1};

use crate::dynlinker;
use crate::log::LogSink;
use crate::wire::chrono_compat::Timestamp;
use crate::wire::{Link, UploadHeader};

/// CLI flags for `rcoredump`, the forwarder.
///
/// Mirrors Linux's `core_pattern` placeholder conventions: the kernel
/// invokes this binary with `%E` (executable path, `/` replaced by `!`) and
/// `%t` (crash time, seconds since epoch) as positional arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "rcoredump", author, version, about = "Core dump forwarder")]
pub struct Cli {
    /// Crashed executable's absolute path, with `/` replaced by `!` (`%E`).
    pub executable: String,

    /// Crash time, seconds since the Unix epoch (`%t`).
    pub timestamp: i64,

    /// Indexer base URL, e.g. `http://indexer:1234`.
    #[arg(long = "dest")]
    pub dest: String,

    /// Where to read the core bytes from; `-` means stdin.
    #[arg(long = "src", default_value = "-")]
    pub src: String,

    /// Extra metadata as `key=value` pairs separated by `;`.
    #[arg(long = "metadata", default_value = "")]
    pub metadata: String,

    /// Log to syslog instead of stderr.
    #[arg(long)]
    pub syslog: bool,

    /// Log to this file instead of stderr.
    #[arg(long = "filelog")]
    pub filelog: Option<PathBuf>,
}

impl Cli {
    pub fn log_sink(&self) -> LogSink {
        if self.syslog {
            LogSink::Syslog
        } else if let Some(path) = &self.filelog {
            LogSink::File(path.clone())
        } else {
            LogSink::Stderr
        }
    }
}

/// Undoes the kernel's `%E` escaping (`/` replaced by `!`).
pub fn decode_executable_path(raw: &str) -> String {
    raw.replace('!', "/")
}

/// Parses `key=value;key=value` into a map; empty segments are ignored.
pub fn parse_metadata(s: &str) -> BTreeMap<String, String> {
    s.split(';')
        .filter(|kv| !kv.is_empty())
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Best-effort hostname, read straight from the kernel rather than pulling in
/// a dependency for a single line: `/proc/sys/kernel/hostname` holds exactly
/// the string `gethostname(2)` would return, with a trailing newline.
pub fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn sha1_hex(path: &Path) -> anyhow::Result<String> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).context("hashing executable")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(base16::encode_lower(&hasher.finalize()))
}

fn gzip_bytes(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    use std::io::Write;
    let mut encoder = GzWriter::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).context("gzip-encoding segment")?;
    encoder.finish().context("finishing gzip segment")
}

/// Opens `src` for reading: a path, or stdin when `src == "-"`.
fn open_src(src: &str) -> anyhow::Result<Box<dyn Read + Send>> {
    if src == "-" {
        Ok(Box::new(std::io::stdin()))
    } else {
        Ok(Box::new(
            std::fs::File::open(src).with_context(|| format!("opening core source {src}"))?,
        ))
    }
}

/// Checks whether the indexer already has `hash`, retrying connectivity
/// failures with a short backoff. If every retry fails (the indexer is
/// unreachable), the check is skipped and the executable is sent anyway: a
/// spurious re-upload is cheap, a lost crash report is not.
fn executable_present(client: &reqwest::blocking::Client, dest: &str, hash: &str) -> bool {
    const ATTEMPTS: u32 = 3;
    let url = format!("{dest}/executables/{hash}");
    for attempt in 0..ATTEMPTS {
        match client.head(&url).send() {
            Ok(resp) => return resp.status().is_success(),
            Err(e) => {
                tracing::warn!(attempt, %e, "checking executable presence failed");
                if attempt + 1 < ATTEMPTS {
                    std::thread::sleep(Duration::from_millis(200 * 2u64.pow(attempt)));
                }
            }
        }
    }
    tracing::warn!("giving up on executable presence check, sending it unconditionally");
    false
}

/// Builds the request body: the gzip-concatenated header, core, optional
/// executable, and resolved-library segments, in the order [`crate::upload`]
/// expects them. Core and library segments compress straight from their
/// source files rather than buffering, so a multi-gigabyte core never lives
/// in memory at once.
fn build_body(
    header: &UploadHeader,
    core_src: Box<dyn Read + Send>,
    executable_path: &Path,
    include_executable: bool,
    links: &[Link],
) -> anyhow::Result<Box<dyn Read + Send>> {
    let header_bytes = gzip_bytes(&serde_json::to_vec(header)?)?;
    let mut body: Box<dyn Read + Send> = Box::new(std::io::Cursor::new(header_bytes));

    let core_gz = GzEncoder::new(core_src, Compression::default());
    body = Box::new(body.chain(core_gz));

    if include_executable {
        let executable_file = std::fs::File::open(executable_path)
            .with_context(|| format!("opening {}", executable_path.display()))?;
        let executable_gz = GzEncoder::new(executable_file, Compression::default());
        body = Box::new(body.chain(executable_gz));
    }

    for link in links.iter().filter(|link| link.found && link.error.is_empty()) {
        let file = std::fs::File::open(&link.resolved_path)
            .with_context(|| format!("opening library {}", link.resolved_path))?;
        let gz = GzEncoder::new(file, Compression::default());
        body = Box::new(body.chain(gz));
    }

    Ok(body)
}

/// Runs one full forward: resolve libraries, hash the executable, check for
/// dedup, assemble the upload body, and POST it.
pub fn run(cli: &Cli) -> anyhow::Result<()> {
    let executable_path = PathBuf::from(decode_executable_path(&cli.executable));
    let metadata = parse_metadata(&cli.metadata);

    let links = dynlinker::resolve_links(&executable_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "resolving shared libraries failed, shipping none");
        Vec::new()
    });

    let executable_hash = sha1_hex(&executable_path)?;

    let client = reqwest::blocking::Client::new();
    let include_executable = !executable_present(&client, &cli.dest, &executable_hash);

    let header = UploadHeader {
        dumped_at: Timestamp::from_unix_seconds(cli.timestamp),
        hostname: hostname(),
        executable_path: executable_path.to_string_lossy().into_owned(),
        executable_hash: executable_hash.clone(),
        include_executable,
        metadata,
        forwarder_version: env!("CARGO_PKG_VERSION").to_string(),
        links: links.clone(),
    };

    let core_src = open_src(&cli.src)?;
    let body = build_body(&header, core_src, &executable_path, include_executable, &links)?;

    let url = format!("{}/cores", cli.dest);
    let response = client
        .post(&url)
        .body(reqwest::blocking::Body::new(body))
        .send()
        .with_context(|| format!("posting core to {url}"))?;
    if !response.status().is_success() {
        anyhow::bail!("indexer rejected upload: {}", response.status());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_executable_path_restores_slashes() {
        assert_eq!(decode_executable_path("!usr!bin!myapp"), "/usr/bin/myapp");
    }

    #[test]
    fn parse_metadata_splits_pairs() {
        let meta = parse_metadata("env=prod;region=eu");
        assert_eq!(meta.get("env").map(String::as_str), Some("prod"));
        assert_eq!(meta.get("region").map(String::as_str), Some("eu"));
    }

    #[test]
    fn parse_metadata_ignores_empty_string() {
        assert!(parse_metadata("").is_empty());
    }

    #[test]
    fn sha1_hex_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(
            sha1_hex(&path).unwrap(),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }
}

// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! Best-effort stack trace extraction for one core: detect the executable's
//! source language by ELF section inspection, shell out to the configured
//! debugger, and write the trace back onto the document.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use object::{Object, ObjectSection};

use crate::index::Index;
use crate::log::ResultExt;
use crate::metrics::Metrics;
use crate::store::Store;
use crate::wire::chrono_compat::Timestamp;
use crate::wire::Uid;

/// Section name emitted by one compiler family; its presence is used as a
/// language fingerprint per the ELF introspection this analyzer is limited
/// to (symbolization proper is delegated to the external debugger).
const GO_BUILDINFO_SECTION: &str = ".go.buildinfo";

/// Upper bound on captured debugger output, so a runaway `gdb`/`dlv`
/// invocation cannot grow a trace without limit.
const DEFAULT_TRACE_BYTE_LIMIT: usize = 1 << 20;

pub struct Analyzer {
    store: Store,
    index: Arc<dyn Index>,
    data_dir: PathBuf,
    go_analyzer: Vec<String>,
    c_analyzer: Vec<String>,
    trace_byte_limit: usize,
    metrics: Arc<Metrics>,
}

impl Analyzer {
    pub fn new(
        store: Store,
        index: Arc<dyn Index>,
        data_dir: PathBuf,
        go_analyzer: Vec<String>,
        c_analyzer: Vec<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Analyzer {
            store,
            index,
            data_dir,
            go_analyzer,
            c_analyzer,
            trace_byte_limit: DEFAULT_TRACE_BYTE_LIMIT,
            metrics,
        }
    }

    /// Runs the pipeline for `uid`, logging and swallowing any failure: a
    /// failed analysis simply leaves the document `analyzed=false`, to be
    /// retried by the next restart's recovery sweep or an explicit
    /// `_analyze` request.
    pub async fn analyze(&self, uid: Uid) {
        match self
            .analyze_inner(uid)
            .await
            .with_context(|| format!("analyzing {uid}"))
        {
            Ok(()) => self.metrics.analyses_total.with_label_values(&["success"]).inc(),
            Err(e) => {
                self.metrics.analyses_total.with_label_values(&["failure"]).inc();
                Err::<(), _>(e).or_warn();
            }
        }
    }

    async fn analyze_inner(&self, uid: Uid) -> anyhow::Result<()> {
        // Re-read from the index rather than trust the dispatcher's payload:
        // a document enqueued for analysis may since have been re-indexed
        // (e.g. by a prior, partially successful analysis attempt).
        let mut coredump = self
            .index
            .find(uid)
            .await
            .with_context(|| format!("loading {uid} from index"))?;

        self.store
            .stat_core(uid)
            .await
            .context("core file missing from store")?;
        let executable_path = self.store.executable_path(&coredump.executable_hash);
        let executable_bytes = tokio::fs::read(&executable_path)
            .await
            .with_context(|| format!("reading executable {}", executable_path.display()))?;

        let lang = detect_language(&executable_bytes).context("detecting language")?;
        coredump.lang = Some(lang.to_string());

        let template = match lang {
            "Go" => &self.go_analyzer,
            _ => &self.c_analyzer,
        };
        if template.is_empty() {
            tracing::warn!(uid = %uid, lang, "no analyzer template configured, skipping trace extraction");
        } else {
            let core_path = self.store.core_path(uid);
            let argv = render_argv(template, &executable_path, &core_path, &self.data_dir);
            let trace = run_captured(&argv, self.trace_byte_limit)
                .await
                .context("extracting stack trace")?;
            coredump.trace = Some(trace);
        }

        coredump.analyzed = true;
        coredump.analyzed_at = Some(Timestamp::now());
        self.index
            .index(coredump)
            .await
            .context("writing back analysis results")?;
        Ok(())
    }
}

/// Parses `bytes` as ELF and tags `Go` if a `.go.buildinfo` section is
/// present, `C` otherwise. Extensible to further probes by adding more
/// section-name checks here.
fn detect_language(bytes: &[u8]) -> anyhow::Result<&'static str> {
    let file = object::File::parse(bytes).context("parsing executable as ELF")?;
    for section in file.sections() {
        if section.name().ok() == Some(GO_BUILDINFO_SECTION) {
            return Ok("Go");
        }
    }
    Ok("C")
}

/// Renders each argv token independently, substituting the three named
/// placeholders. Per-token substitution (rather than building one string and
/// splitting on whitespace) means a path containing spaces survives intact.
fn render_argv(template: &[String], executable: &Path, core: &Path, data_dir: &Path) -> Vec<String> {
    template
        .iter()
        .map(|token| {
            token
                .replace("{Executable}", &executable.to_string_lossy())
                .replace("{Core}", &core.to_string_lossy())
                .replace("{DataDir}", &data_dir.to_string_lossy())
        })
        .collect()
}

/// Runs `argv[0] argv[1..]`, capturing combined stdout+stderr truncated to
/// `byte_limit` bytes.
async fn run_captured(argv: &[String], byte_limit: usize) -> anyhow::Result<String> {
    let (program, args) = argv
        .split_first()
        .context("analyzer command template is empty")?;
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("running {program}"))?;
    if !output.status.success() {
        tracing::debug!(
            program,
            status = %output.status,
            "analyzer command exited non-zero (trace still captured)"
        );
    }
    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    combined.truncate(byte_limit);
    Ok(String::from_utf8_lossy(&combined).into_owned())
}

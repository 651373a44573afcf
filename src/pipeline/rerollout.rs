//! Record orchestration: load, schedule, regenerate, write.
//!
//! Pipeline flow:
//! Records → (resume filter) → bounded tasks → Turn Regenerator → JSONL (completion order)

use crate::checkpoint::OutputWriter;
use crate::client::ChatCompleter;
use crate::models::{
    ErrorRecord, Message, Record, RerollError, Result, RunSummary, TokenStats, format_tokens,
    normalize_record,
};
use crate::rerollout::TurnRegenerator;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Before/after dump of the first successful record.
#[derive(Debug, Serialize)]
struct Proof<'a> {
    description: &'static str,
    model: &'a str,
    id: &'a str,
    generated_at: DateTime<Utc>,
    #[serde(rename = "BEFORE")]
    before: &'a Record,
    #[serde(rename = "AFTER")]
    after: &'a Record,
}

#[derive(Debug)]
struct ProofTarget {
    path: PathBuf,
    model: String,
    written: AtomicBool,
}

impl ProofTarget {
    /// Write the proof for the first record that gets here; later calls are no-ops.
    async fn offer(&self, before: &Record, after: &Record) {
        if self.written.swap(true, Ordering::AcqRel) {
            return;
        }

        let proof = Proof {
            description: "First successfully regenerated record, before and after",
            model: &self.model,
            id: &after.id,
            generated_at: Utc::now(),
            before,
            after,
        };
        let result = match serde_json::to_string_pretty(&proof) {
            Ok(json) => tokio::fs::write(&self.path, json)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => info!(path = %self.path.display(), id = %after.id, "Proof written"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to write proof"),
        }
    }
}

/// Successful records whose assistant turns are logged side by side at DEBUG.
const COMPARISON_LIMIT: usize = 3;

/// Characters of text kept per turn in the comparison log.
const COMPARISON_PREVIEW_CHARS: usize = 60;

/// One line per assistant turn: the first tool called, or the start of the text.
fn assistant_turns(record: &Record) -> Vec<String> {
    record
        .messages
        .iter()
        .filter_map(|m| match m {
            Message::Assistant(msg) => Some(match msg.first_tool_name() {
                Some(name) => format!("TOOL: {name}"),
                None => {
                    let preview: String = msg.content.chars().take(COMPARISON_PREVIEW_CHARS).collect();
                    format!("TEXT: {preview:?}...")
                }
            }),
            _ => None,
        })
        .collect()
}

/// `<input stem>_rerolled.jsonl` next to the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{stem}_rerolled.jsonl"))
}

/// Regenerate one record and write its line. `Ok(false)` means an error line.
async fn process_record(
    regenerator: &TurnRegenerator,
    original: &Record,
    writer: &OutputWriter,
    proof: Option<&ProofTarget>,
    compared: &AtomicUsize,
) -> Result<bool> {
    match regenerator.regenerate(original).await {
        Ok(rerolled) => {
            writer.write_line(&rerolled).await?;
            if let Some(proof) = proof {
                proof.offer(original, &rerolled).await;
            }
            if tracing::enabled!(tracing::Level::DEBUG)
                && compared.fetch_add(1, Ordering::Relaxed) < COMPARISON_LIMIT
            {
                debug!(id = %original.id, "BEFORE");
                for (idx, turn) in assistant_turns(original).iter().enumerate() {
                    debug!("  [{idx}] {turn}");
                }
                debug!(id = %rerolled.id, "AFTER");
                for (idx, turn) in assistant_turns(&rerolled).iter().enumerate() {
                    debug!("  [{idx}] {turn}");
                }
            }
            debug!(id = %original.id, "Record regenerated");
            Ok(true)
        }
        Err(e) => {
            warn!(id = %original.id, error = %e, "Record failed");
            writer
                .write_line(&ErrorRecord::new(original.clone(), e.to_string()))
                .await?;
            Ok(false)
        }
    }
}

/// Regenerates a dataset with bounded concurrency.
pub struct RerolloutPipeline {
    regenerator: Arc<TurnRegenerator>,
    concurrency: usize,
    show_progress: bool,
    proof: Option<Arc<ProofTarget>>,
    compared: Arc<AtomicUsize>,
}

impl RerolloutPipeline {
    pub fn new(client: Arc<dyn ChatCompleter>, concurrency: usize) -> Self {
        let stats = Arc::new(TokenStats::new());
        Self {
            regenerator: Arc::new(TurnRegenerator::new(client, stats)),
            concurrency: concurrency.clamp(1, Semaphore::MAX_PERMITS),
            show_progress: true,
            proof: None,
            compared: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Draw the progress bar (off in verbose mode, where logs take over).
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Dump the first successful record to `path`.
    pub fn with_proof(mut self, path: PathBuf, model: impl Into<String>) -> Self {
        self.proof = Some(Arc::new(ProofTarget {
            path,
            model: model.into(),
            written: AtomicBool::new(false),
        }));
        self
    }

    pub fn stats(&self) -> &Arc<TokenStats> {
        self.regenerator.stats()
    }

    /// Load records from JSONL, or from a JSON array when the file ends in `.json`.
    pub fn load_records(path: &Path) -> Result<Vec<Record>> {
        let is_json_array = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let records = if is_json_array {
            let file = File::open(path).map_err(|e| RerollError::io("opening input file", e))?;
            let raw: Vec<Value> = serde_json::from_reader(BufReader::new(file))
                .map_err(|e| RerollError::ParseError(format!("Invalid JSON array: {}", e)))?;
            raw.into_iter()
                .enumerate()
                .map(|(idx, value)| {
                    serde_json::from_value(normalize_record(value))
                        .map_err(|e| RerollError::ParseError(format!("Record {}: {}", idx, e)))
                })
                .collect::<Result<Vec<Record>>>()?
        } else {
            let file = File::open(path).map_err(|e| RerollError::io("opening input file", e))?;
            let mut records = Vec::new();
            for (line_num, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|e| RerollError::io("reading input file", e))?;
                if line.trim().is_empty() {
                    continue;
                }
                let record = serde_json::from_str::<Value>(&line)
                    .and_then(|value| serde_json::from_value(normalize_record(value)))
                    .map_err(|e| RerollError::ParseError(format!("Line {}: {}", line_num + 1, e)))?;
                records.push(record);
            }
            records
        };

        info!(count = records.len(), path = %path.display(), "Loaded records");
        Ok(records)
    }

    /// Apply `--index` (one record) or `--num` (first N records).
    pub fn select(
        mut records: Vec<Record>,
        num: Option<usize>,
        index: Option<usize>,
    ) -> Result<Vec<Record>> {
        if let Some(index) = index {
            if index >= records.len() {
                return Err(RerollError::InvalidInput(format!(
                    "Index {} out of range ({} records)",
                    index,
                    records.len()
                )));
            }
            return Ok(vec![records.swap_remove(index)]);
        }
        if let Some(num) = num {
            records.truncate(num);
        }
        Ok(records)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
        );
        pb
    }

    fn progress_message(&self, success: usize, error: usize) -> String {
        let tokens = self.stats().snapshot();
        format!(
            "ok: {}, err: {} | {:.0} tok/s | {} tokens",
            success,
            error,
            tokens.completion_per_sec,
            format_tokens(tokens.total)
        )
    }

    /// Regenerate every record not already in `processed`, writing each result
    /// to `writer` as it completes.
    ///
    /// Record failures become error lines; only an unwritable output aborts.
    pub async fn run(
        &self,
        records: Vec<Record>,
        processed: &HashSet<String>,
        writer: Arc<OutputWriter>,
    ) -> Result<RunSummary> {
        let start = Instant::now();
        let total_records = records.len();

        let pending: Vec<Record> = records
            .into_iter()
            .filter(|r| r.id.is_empty() || !processed.contains(&r.id))
            .collect();
        let skipped = total_records - pending.len();

        let mut summary = RunSummary {
            total_records,
            skipped,
            ..Default::default()
        };

        if pending.is_empty() {
            info!(skipped, "All records already processed, nothing to do");
            summary.tokens = self.stats().snapshot();
            return Ok(summary);
        }

        info!(
            pending = pending.len(),
            skipped,
            concurrency = self.concurrency,
            output = %writer.path().display(),
            "Starting rerollout"
        );

        let pb = self.progress_bar(pending.len());
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::with_capacity(pending.len());

        for record in pending {
            let record = Arc::new(record);
            let semaphore = Arc::clone(&semaphore);
            let regenerator = Arc::clone(&self.regenerator);
            let writer = Arc::clone(&writer);
            let proof = self.proof.clone();
            let compared = Arc::clone(&self.compared);
            let original = Arc::clone(&record);

            let handle = tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| RerollError::Internal("Semaphore closed".to_string()))?;
                process_record(&regenerator, &original, &writer, proof.as_deref(), &compared).await
            });
            in_flight.insert(handle.id(), record);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let succeeded = match joined {
                Ok((id, outcome)) => {
                    in_flight.remove(&id);
                    // Ok(Err) means the output itself is broken
                    outcome?
                }
                Err(join_error) => {
                    let Some(original) = in_flight.remove(&join_error.id()) else {
                        continue;
                    };
                    warn!(id = %original.id, error = %join_error, "Record task panicked");
                    let line = ErrorRecord::new(
                        (*original).clone(),
                        format!("Task panicked: {}", join_error),
                    );
                    writer.write_line(&line).await?;
                    false
                }
            };

            if succeeded {
                summary.success += 1;
            } else {
                summary.error += 1;
            }
            pb.inc(1);
            pb.set_message(self.progress_message(summary.success, summary.error));
        }

        pb.finish_with_message(format!(
            "Done! {} ok, {} errors",
            summary.success, summary.error
        ));

        summary.runtime_secs = start.elapsed().as_secs_f64();
        summary.tokens = self.stats().snapshot();
        summary.finalize();

        info!(
            success = summary.success,
            error = summary.error,
            skipped = summary.skipped,
            throughput = format!("{:.2} rec/s", summary.records_per_sec),
            tokens = %format_tokens(summary.tokens.total),
            "Rerollout complete"
        );

        Ok(summary)
    }
}

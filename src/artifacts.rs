//! Run artifacts: human review queues and raw responses of failed batches
//!
//! Review records are collected during a run and written once at the end,
//! one file per bucket, entries grouped by reason. Raw responses are written
//! immediately so they survive an abort.

use crate::classify::Classification;
use crate::model::{Batch, MatchCandidate};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

const ANNOTATION: &str = "  [ ] approve   [ ] reject   [ ] modify: ____________";

/// Timestamp format used in artifact and checkpoint file names.
pub const FILE_STAMP: &str = "%Y%m%d_%H%M%S";

/// First free path of the form `<stem>.<ext>`, `<stem>_2.<ext>`, ...
pub(crate) fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let mut path = dir.join(format!("{}.{}", stem, ext));
    let mut n = 2;
    while path.exists() {
        path = dir.join(format!("{}_{}.{}", stem, n, ext));
        n += 1;
    }
    path
}

fn file_safe(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '+' { c } else { '_' })
        .take(80)
        .collect()
}

#[derive(Debug, Default)]
struct Bucket {
    groups: BTreeMap<String, Vec<String>>,
    count: usize,
}

impl Bucket {
    fn push(&mut self, group: impl Into<String>, entry: String) {
        self.groups.entry(group.into()).or_default().push(entry);
        self.count += 1;
    }
}

pub struct ArtifactWriter {
    dir: PathBuf,
    stamp: String,
    review: Bucket,
    created: Bucket,
    invalid: Bucket,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>, started_at: DateTime<Utc>) -> Self {
        Self {
            dir: dir.into(),
            stamp: started_at.format(FILE_STAMP).to_string(),
            review: Bucket::default(),
            created: Bucket::default(),
            invalid: Bucket::default(),
        }
    }

    /// Queue the human-facing parts of a batch's classification.
    pub fn record(&mut self, batch: &Batch, classification: &Classification) {
        let label = batch.label();
        for item in &classification.review {
            self.review.push(
                item.reason.group(),
                entry(item.matched.candidate(), &label, Some(&item.reason.to_string())),
            );
        }
        for matched in &classification.created {
            self.created.push(
                "unverified new entries",
                entry(matched.candidate(), &label, None),
            );
        }
        for invalid in &classification.invalid {
            self.invalid.push(
                invalid.error.group(),
                entry(&invalid.candidate, &label, Some(&invalid.error.to_string())),
            );
        }
    }

    /// Save a failed batch's raw response for offline inspection.
    pub fn save_failed_response(&self, batch: &Batch, raw: &str) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let stem = format!("failed_{}_{}", file_safe(&batch.label()), Utc::now().format(FILE_STAMP));
        let path = unique_path(&self.dir, &stem, "txt");
        std::fs::write(&path, raw)?;
        Ok(path)
    }

    /// Write the non-empty review buckets. Returns the files written.
    pub fn finish(&self) -> io::Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for (name, bucket) in [
            ("review", &self.review),
            ("created", &self.created),
            ("invalid", &self.invalid),
        ] {
            if bucket.count == 0 {
                continue;
            }
            std::fs::create_dir_all(&self.dir)?;
            let path = unique_path(&self.dir, &format!("{}_{}", name, self.stamp), "txt");
            std::fs::write(&path, render(name, &self.stamp, bucket))?;
            written.push(path);
        }
        Ok(written)
    }
}

fn entry(candidate: &MatchCandidate, batch_label: &str, detail: Option<&str>) -> String {
    let mut out = format!("- {}  [batch {}]\n", candidate, batch_label);
    if let Some(detail) = detail {
        let _ = writeln!(out, "  why: {}", detail);
    }
    if !candidate.reasons.is_empty() {
        let _ = writeln!(out, "  backend reasons: {}", candidate.reasons.join("; "));
    }
    let _ = writeln!(out, "{}", ANNOTATION);
    out
}

fn render(name: &str, stamp: &str, bucket: &Bucket) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# concord {} queue, run {}: {} entries", name, stamp, bucket.count);
    for (group, entries) in &bucket.groups {
        let _ = writeln!(out, "\n## {} ({})\n", group, entries.len());
        for e in entries {
            out.push_str(e);
        }
    }
    out
}

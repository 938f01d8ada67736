//! File-backed job repository using an append-only JSON-lines log.
//!
//! Each write appends one entry and is synced to disk before it returns; a
//! failed or partial append is cut back before the next one. The
//! log is replayed into memory on open and rewritten in place (via a temp file
//! and rename) once it holds many superseded entries.

use std::collections::HashMap;
use std::fs::{self, create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{JobRecord, JobRepository, SchedulerError};
use crate::util::ids::JobId;

const LOG_FILE: &str = "jobs.jsonl";
const DEFAULT_COMPACTION_THRESHOLD: usize = 1024;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum LogEntry {
    Upsert { record: JobRecord },
    Remove { job_id: JobId },
}

fn io_error(action: &str, path: &Path, err: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::Repository(format!("{action} {}: {err}", path.display()))
}

/// Durable repository stored under a directory.
pub struct FileJobRepository {
    dir: PathBuf,
    log: File,
    /// Length of the log up to the last fully synced entry.
    committed_len: u64,
    records: HashMap<JobId, JobRecord>,
    log_entries: usize,
    compaction_threshold: usize,
}

impl FileJobRepository {
    /// Open (or create) the repository in `dir` and replay its log.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Repository`] if the directory or log cannot be read,
    /// or a log entry other than the last one is corrupt.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir).map_err(|e| io_error("create", &dir, e))?;
        let path = dir.join(LOG_FILE);
        let (records, log_entries, torn) = Self::replay(&path)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error("open", &path, e))?;
        let committed_len = log.metadata().map_err(|e| io_error("stat", &path, e))?.len();
        debug!(path = %path.display(), records = records.len(), log_entries, "job log replayed");
        let mut repo = Self {
            dir,
            log,
            committed_len,
            records,
            log_entries,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        };
        if torn {
            // Appending after a partial line would corrupt the next entry.
            repo.compact()?;
        }
        Ok(repo)
    }

    /// Compact once the log holds more than `threshold` entries and at least
    /// twice as many entries as live records.
    #[must_use]
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold.max(1);
        self
    }

    /// Directory holding the log.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Entries currently in the log file.
    #[must_use]
    pub const fn log_entries(&self) -> usize {
        self.log_entries
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn replay(path: &Path) -> Result<(HashMap<JobId, JobRecord>, usize, bool), SchedulerError> {
        let mut records = HashMap::new();
        if !path.exists() {
            return Ok((records, 0, false));
        }
        let bytes = fs::read(path).map_err(|e| io_error("read", path, e))?;
        // A torn tail may end inside a multi-byte character.
        let content = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = content.lines().collect();

        let last = lines.len().saturating_sub(1);
        let mut entries = 0;
        // A final entry without its newline must be rewritten before appending.
        let mut torn = !content.is_empty() && !content.ends_with('\n');
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(LogEntry::Upsert { record }) => {
                    records.insert(record.job_id.clone(), record);
                }
                Ok(LogEntry::Remove { job_id }) => {
                    records.remove(&job_id);
                }
                // A torn final line is an append that never completed.
                Err(e) if idx == last => {
                    warn!(path = %path.display(), error = %e, "ignoring truncated log tail");
                    torn = true;
                    continue;
                }
                Err(e) => return Err(io_error("parse", path, format!("line {}: {e}", idx + 1))),
            }
            entries += 1;
        }
        Ok((records, entries, torn))
    }

    fn append(&mut self, entry: &LogEntry) -> Result<(), SchedulerError> {
        let path = self.log_path();
        let mut line = serde_json::to_string(entry).map_err(|e| io_error("encode", &path, e))?;
        line.push('\n');
        self.truncate_torn_tail()?;
        let written = self
            .log
            .write_all(line.as_bytes())
            .map_err(|e| io_error("append", &path, e))
            .and_then(|()| self.log.sync_data().map_err(|e| io_error("sync", &path, e)));
        if let Err(e) = written {
            // Drop whatever part of the entry reached the file.
            if let Err(trunc) = self.log.set_len(self.committed_len) {
                warn!(path = %path.display(), error = %trunc, "cannot roll back failed append");
            }
            return Err(e);
        }
        self.committed_len = self
            .committed_len
            .saturating_add(u64::try_from(line.len()).unwrap_or(u64::MAX));
        self.log_entries += 1;
        Ok(())
    }

    /// Cut the log back to its last committed entry if anything follows it.
    fn truncate_torn_tail(&mut self) -> Result<(), SchedulerError> {
        let path = self.log_path();
        let len = self.log.metadata().map_err(|e| io_error("stat", &path, e))?.len();
        if len == self.committed_len {
            return Ok(());
        }
        warn!(
            path = %path.display(),
            committed = self.committed_len,
            len,
            "truncating partial entry at end of job log"
        );
        self.log
            .set_len(self.committed_len)
            .and_then(|()| self.log.sync_data())
            .map_err(|e| io_error("truncate", &path, e))
    }

    fn maybe_compact(&mut self) {
        let live = self.records.len();
        if self.log_entries <= self.compaction_threshold || self.log_entries < live.saturating_mul(2) {
            return;
        }
        if let Err(e) = self.compact() {
            // The append log is still intact; try again on a later write.
            warn!(path = %self.log_path().display(), error = %e, "job log compaction failed");
        }
    }

    /// Rewrite the log so it holds exactly one entry per live record.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Repository`] on I/O failure; the previous log stays
    /// in place.
    pub fn compact(&mut self) -> Result<(), SchedulerError> {
        let path = self.log_path();
        let tmp = self.dir.join(format!("{LOG_FILE}.tmp"));
        {
            let mut file = File::create(&tmp).map_err(|e| io_error("create", &tmp, e))?;
            for record in self.records.values() {
                let entry = LogEntry::Upsert {
                    record: record.clone(),
                };
                let line = serde_json::to_string(&entry).map_err(|e| io_error("encode", &tmp, e))?;
                writeln!(file, "{line}").map_err(|e| io_error("write", &tmp, e))?;
            }
            file.sync_all().map_err(|e| io_error("sync", &tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| io_error("rename", &tmp, e))?;
        self.log = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| io_error("reopen", &path, e))?;
        self.committed_len = self.log.metadata().map_err(|e| io_error("stat", &path, e))?.len();
        let before = self.log_entries;
        self.log_entries = self.records.len();
        debug!(path = %path.display(), before, after = self.log_entries, "job log compacted");
        Ok(())
    }
}

impl JobRepository for FileJobRepository {
    fn upsert(&mut self, record: &JobRecord) -> Result<(), SchedulerError> {
        self.append(&LogEntry::Upsert {
            record: record.clone(),
        })?;
        self.records.insert(record.job_id.clone(), record.clone());
        self.maybe_compact();
        Ok(())
    }

    fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, SchedulerError> {
        Ok(self.records.get(job_id).cloned())
    }

    fn list_pending(&self) -> Result<Vec<JobRecord>, SchedulerError> {
        Ok(self
            .records
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect())
    }

    fn remove(&mut self, job_id: &JobId) -> Result<bool, SchedulerError> {
        if !self.records.contains_key(job_id) {
            return Ok(false);
        }
        self.append(&LogEntry::Remove {
            job_id: job_id.clone(),
        })?;
        self.records.remove(job_id);
        self.maybe_compact();
        Ok(true)
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use parking_lot::Mutex;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::config::STALE_LOCK_THRESHOLD;
use crate::error::{GroveError, Result};
use crate::frontmatter;
use crate::job::{Job, JobMetadata, JobStatus};
use crate::plan::Plan;

static WRITE_NONCE: AtomicU64 = AtomicU64::new(0);

const OUTPUT_HEADER: &str = "## Output";

/// Advisory per-file lock: a sibling `<path>.lock` created with
/// exclusive-create semantics and tagged with the writer's PID. Dropping
/// the guard releases the lock. Locks are deliberately sentinel files
/// rather than `flock` so they behave on networked filesystems; staleness
/// is judged by mtime.
#[derive(Debug)]
pub struct JobLock {
    lock_path: PathBuf,
}

impl JobLock {
    fn lock_path_for(job_path: &Path) -> PathBuf {
        let mut name = job_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".lock");
        job_path.with_file_name(name)
    }

    fn acquire(job_path: &Path, stale_after: Duration) -> Result<JobLock> {
        let lock_path = Self::lock_path_for(job_path);
        for attempt in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "pid={}", std::process::id());
                    return Ok(JobLock { lock_path });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && lock_is_stale(&lock_path, stale_after) {
                        debug!(lock = %lock_path.display(), "reclaiming stale lock");
                        let _ = fs::remove_file(&lock_path);
                        continue;
                    }
                    let holder = fs::read_to_string(&lock_path)
                        .map(|contents| contents.trim().to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    return Err(GroveError::Locked {
                        path: job_path.to_path_buf(),
                        holder,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("lock acquisition loops at most twice");
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn lock_is_stale(lock_path: &Path, stale_after: Duration) -> bool {
    let Ok(metadata) = fs::metadata(lock_path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age >= stale_after)
        .unwrap_or(false)
}

/// Writes job-file mutations. Disk first, memory second: the in-memory
/// job is only touched after the rewrite lands, so a failed write leaves
/// the cache matching the file.
pub struct StatePersister {
    stale_after: Duration,
    /// Serializes this persister's own operations; the lock file remains
    /// the cross-process authority.
    inner: Mutex<()>,
}

impl Default for StatePersister {
    fn default() -> Self {
        Self::new()
    }
}

impl StatePersister {
    pub fn new() -> Self {
        Self::with_stale_threshold(STALE_LOCK_THRESHOLD)
    }

    pub fn with_stale_threshold(stale_after: Duration) -> Self {
        StatePersister {
            stale_after,
            inner: Mutex::new(()),
        }
    }

    /// Take the advisory lock for a job file. Executors hold this across
    /// the whole run; the `*_locked` operations require it.
    pub fn lock_job(&self, job: &Job) -> Result<JobLock> {
        JobLock::acquire(&job.file_path, self.stale_after)
    }

    pub fn update_job_status(&self, job: &mut Job, status: JobStatus) -> Result<()> {
        let lock = self.lock_job(job)?;
        self.update_job_status_locked(&lock, job, status)
    }

    pub fn update_job_status_locked(
        &self,
        _lock: &JobLock,
        job: &mut Job,
        status: JobStatus,
    ) -> Result<()> {
        let _guard = self.inner.lock();
        let now = Utc::now();

        let mut updates = Mapping::new();
        let mut put = |key: &str, value: Value| {
            updates.insert(Value::String(key.to_string()), value);
        };
        put("status", Value::String(status.as_str().to_string()));
        put("updated_at", Value::String(now.to_rfc3339()));

        let mut start_time = job.start_time;
        let mut end_time = job.end_time;
        if status == JobStatus::Running && start_time.is_none() {
            start_time = Some(now);
            put("started_at", Value::String(now.to_rfc3339()));
        }
        if status.is_terminal() {
            end_time = Some(now);
            put("completed_at", Value::String(now.to_rfc3339()));
            if let Some(started) = start_time {
                let seconds = (now - started).num_milliseconds() as f64 / 1000.0;
                put("duration", Value::String(format!("{seconds:.3}s")));
            }
        }

        let bytes = fs::read(&job.file_path)?;
        let rewritten = frontmatter::merge_buffer(&bytes, updates)?;
        atomic_write(&job.file_path, rewritten.as_bytes())?;

        job.status = status;
        job.updated_at = Some(now);
        job.start_time = start_time;
        job.end_time = end_time;
        Ok(())
    }

    pub fn update_job_metadata(&self, job: &mut Job, meta: &JobMetadata) -> Result<()> {
        let lock = self.lock_job(job)?;
        self.update_job_metadata_locked(&lock, job, meta)
    }

    pub fn update_job_metadata_locked(
        &self,
        _lock: &JobLock,
        job: &mut Job,
        meta: &JobMetadata,
    ) -> Result<()> {
        let _guard = self.inner.lock();
        let now = Utc::now();

        let mut updates = Mapping::new();
        let mut put = |key: &str, value: Value| {
            updates.insert(Value::String(key.to_string()), value);
        };
        put("retry_count", Value::Number(meta.retry_count.into()));
        put(
            "last_error",
            match &meta.last_error {
                Some(message) => Value::String(message.clone()),
                None => Value::Null,
            },
        );
        put(
            "execution_time",
            match meta.execution_time {
                Some(seconds) => Value::Number(serde_yaml::Number::from(seconds)),
                None => Value::Null,
            },
        );
        put("updated_at", Value::String(now.to_rfc3339()));

        let bytes = fs::read(&job.file_path)?;
        let rewritten = frontmatter::merge_buffer(&bytes, updates)?;
        atomic_write(&job.file_path, rewritten.as_bytes())?;

        job.metadata = meta.clone();
        job.updated_at = Some(now);
        Ok(())
    }

    pub fn append_job_output(&self, job: &mut Job, text: &str) -> Result<()> {
        let lock = self.lock_job(job)?;
        self.append_job_output_locked(&lock, job, text)
    }

    /// Ensure the body carries a `## Output` section and append one
    /// timestamped entry to the end of it.
    pub fn append_job_output_locked(
        &self,
        _lock: &JobLock,
        job: &mut Job,
        text: &str,
    ) -> Result<()> {
        let _guard = self.inner.lock();

        let bytes = fs::read(&job.file_path)?;
        let (mapping, mut body) = frontmatter::parse(&bytes)?;

        let has_output_section = body
            .lines()
            .any(|line| line.trim_end() == OUTPUT_HEADER);
        if !has_output_section {
            if !body.is_empty() && !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&format!("\n{OUTPUT_HEADER}\n"));
        }
        if !body.ends_with('\n') {
            body.push('\n');
        }
        let entry = format!("\n[{}] {}\n", Utc::now().to_rfc3339(), text.trim_end());
        body.push_str(&entry);

        let rewritten = frontmatter::render(&mapping, &body)?;
        atomic_write(&job.file_path, rewritten.as_bytes())?;

        job.prompt_body = body;
        Ok(())
    }

    /// Batch-verify every job file in the plan: present on disk, parsable
    /// frontmatter, required fields, valid status. Returns one message per
    /// problem; an empty list means the plan directory is healthy.
    pub fn validate_job_states(&self, plan: &Plan) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        for job in &plan.jobs {
            if !job.file_path.exists() {
                problems.push(format!("{}: file is missing", job.file_path.display()));
                continue;
            }
            match crate::job::load_job(&job.file_path) {
                Ok(_) => {}
                Err(err) => problems.push(format!("{}: {err}", job.file_path.display())),
            }
        }
        Ok(problems)
    }
}

/// Write-to-temp, fsync, rename-over. The temp file lives in the target's
/// directory so the rename stays on one filesystem.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let nonce = WRITE_NONCE.fetch_add(1, Ordering::Relaxed);
    let epoch_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp = path.with_extension(format!(
        "md.tmp.{}.{}.{}",
        std::process::id(),
        epoch_nanos,
        nonce
    ));

    let mut file = File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(GroveError::WriteConflict {
                path: path.to_path_buf(),
                source: err,
            })
        }
    }
}

/// Read a job file back from disk, tolerating concurrent rewrites: the
/// atomic rename guarantees we see either the old or the new content,
/// never a torn buffer.
pub fn read_job_file(path: &Path) -> Result<(Mapping, String)> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    frontmatter::parse(&buf)
}

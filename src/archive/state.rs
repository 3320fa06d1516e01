//! Archive state: markers, saved-post scans, and the media list
//!
//! The archive's state is read once per run: the `.first_run_options`
//! snapshot, the `.complete` marker, and (when resuming) the saved post
//! files themselves, scanned to recompute the resume cursor.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::NaiveDateTime;
use scraper::{Html, Selector};

use crate::archive::{write_atomic, Layout};
use crate::config::Options;
use crate::{Result, VaultError};

/// Reads the option snapshot an archive was started with, if present
pub fn read_first_run_options(
    root: &Path,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>> {
    let path = root.join(super::FIRST_RUN_OPTIONS);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value: serde_json::Value = serde_json::from_str(&content)?;
    match value {
        serde_json::Value::Object(map) => Ok(Some(map)),
        _ => Err(VaultError::IncompatibleArchive(format!(
            "{} is not a JSON object",
            path.display()
        ))),
    }
}

/// Records the option set a fresh archive is being started with
pub fn write_first_run_options(layout: &Layout, options: &Options) -> Result<()> {
    let snapshot = serde_json::Value::Object(options.to_snapshot());
    write_atomic(
        &layout.first_run_options_path(),
        serde_json::to_string(&snapshot)?.as_bytes(),
    )?;
    Ok(())
}

/// Whether a prior pass covered the full post range
pub fn is_complete(layout: &Layout) -> bool {
    layout.complete_marker().exists()
}

/// Reads the post timestamp out of a saved post file
///
/// Saved posts carry their date as `<time datetime="…Z">`; this is the only
/// place it is recorded, so likes-mode cursor scans must open every file.
pub fn post_timestamp_from_file(path: &Path) -> Result<i64> {
    let content = std::fs::read_to_string(path)?;
    let doc = Html::parse_document(&content);
    let selector = Selector::parse("time[datetime]").map_err(|_| {
        VaultError::MalformedPost("bad time selector".to_string())
    })?;
    let datetime = doc
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("datetime"))
        .ok_or_else(|| {
            VaultError::MalformedPost(format!("{}: no <time datetime>", path.display()))
        })?;
    let parsed = NaiveDateTime::parse_from_str(datetime, "%Y-%m-%dT%H:%M:%SZ").map_err(|e| {
        VaultError::MalformedPost(format!("{}: bad datetime '{}': {}", path.display(), datetime, e))
    })?;
    Ok(parsed.and_utc().timestamp())
}

/// The oldest already-saved timestamp, for resuming an incomplete backup
///
/// Non-likes archives only need to read the file with the smallest id;
/// likes archives are ordered by liked time, which is not in the file name,
/// so every file is read.
pub fn oldest_saved_timestamp(layout: &Layout, files: &[std::path::PathBuf], likes: bool) -> Result<Option<i64>> {
    if files.is_empty() {
        return Ok(None);
    }
    if likes {
        let mut oldest = None;
        for file in files {
            let ts = post_timestamp_from_file(file)?;
            oldest = Some(oldest.map_or(ts, |o: i64| o.min(ts)));
        }
        return Ok(oldest);
    }
    let min_file = files
        .iter()
        .filter_map(|f| layout.post_id_of(f).map(|id| (id, f)))
        .min_by_key(|(id, _)| *id);
    match min_file {
        Some((_, file)) => Ok(Some(post_timestamp_from_file(file)?)),
        None => Ok(None),
    }
}

/// The newest already-saved key, for incremental passes: max id, or max
/// liked timestamp (another full scan) in likes mode
pub fn newest_saved_key(layout: &Layout, files: &[std::path::PathBuf], likes: bool) -> Result<Option<i64>> {
    if files.is_empty() {
        return Ok(None);
    }
    if likes {
        let mut newest = None;
        for file in files {
            let ts = post_timestamp_from_file(file)?;
            newest = Some(newest.map_or(ts, |n: i64| n.max(ts)));
        }
        return Ok(newest);
    }
    Ok(files
        .iter()
        .filter_map(|f| layout.post_id_of(f))
        .max()
        .map(|id| id as i64))
}

/// The append-log of media URLs per post (`media.json`)
///
/// One JSON line per post, deduplicated by post id across resumed runs.
/// This is the one file that is appended in place rather than rewritten
/// atomically.
pub struct MediaLog {
    inner: Mutex<MediaLogInner>,
}

struct MediaLogInner {
    file: File,
    seen: HashSet<u64>,
}

impl MediaLog {
    /// Opens (or creates) the log, reading already-recorded post ids
    pub fn open(layout: &Layout) -> Result<Self> {
        std::fs::create_dir_all(layout.root())?;
        let path = layout.media_list_path();
        let mut seen = HashSet::new();
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;
        for line in BufReader::new(&file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(doc) => {
                    if let Some(id) = doc.get("post").and_then(serde_json::Value::as_u64) {
                        seen.insert(id);
                    }
                }
                Err(e) => tracing::error!("{}: bad media list line: {}", path.display(), e),
            }
        }
        Ok(Self {
            inner: Mutex::new(MediaLogInner { file, seen }),
        })
    }

    /// Appends one post's media URLs, unless the post was already recorded
    pub fn record(&self, ident: u64, urls: &std::collections::BTreeSet<String>) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.seen.insert(ident) {
            return Ok(());
        }
        let line = serde_json::json!({ "post": ident, "media": urls });
        writeln!(inner.file, "{}", line)?;
        inner.file.flush()
    }
}

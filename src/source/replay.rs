//! Replay source
//!
//! Re-reads the raw API documents a previous run saved under `json/`,
//! yielding them through the same interface as the live API, sorted
//! descending by the key the live source would deliver them in.
//!
//! Replay is strictly forward-only: the paging mode may not change
//! mid-run, and every `before` bound must be strictly below the last one.
//! Violating either is a programming error in the caller, not a condition
//! to recover from, so both are asserts.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::source::{Batch, FetchArgs, Meta, PostSource, MAX_POSTS};
use crate::{Result, VaultError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Before,
    Offset,
    Ident,
}

/// A source backed by previously saved per-post response files
#[derive(Debug)]
pub struct ReplaySource {
    files: Vec<PathBuf>,
    likes: bool,
    pos: usize,
    last_mode: Option<Mode>,
    last_before: Option<i64>,
    last_offset: Option<usize>,
}

impl ReplaySource {
    /// Scans `json/` under the given archive root
    ///
    /// With explicit idents, exactly those documents are used, in the given
    /// order; a missing one fails the target up front.
    pub fn new(archive_root: &Path, likes: bool, idents: Option<&[u64]>) -> Result<Self> {
        let json_dir = archive_root.join(crate::archive::JSON_DIR);

        let files = if let Some(idents) = idents {
            let mut files = Vec::with_capacity(idents.len());
            for &ident in idents {
                let path = json_dir.join(format!("{}.json", ident));
                if !path.is_file() {
                    return Err(VaultError::PostNotFound(ident));
                }
                files.push(path);
            }
            files
        } else {
            let mut keyed: Vec<(i64, PathBuf)> = Vec::new();
            if likes {
                tracing::warn!("reading liked timestamps from saved responses (may take a while)");
            }
            let entries = match std::fs::read_dir(&json_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(Self::empty(likes));
                }
                Err(e) => return Err(e.into()),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_none_or(|e| e != "json") || !path.is_file() {
                    continue;
                }
                let key = if likes {
                    match read_doc(&path) {
                        Some(doc) => doc
                            .get("liked_timestamp")
                            .and_then(Value::as_i64)
                            .unwrap_or(0),
                        None => continue,
                    }
                } else {
                    match path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
                        Some(id) => id,
                        None => continue,
                    }
                };
                keyed.push((key, path));
            }
            keyed.sort_by_key(|(key, _)| std::cmp::Reverse(*key));
            keyed.into_iter().map(|(_, path)| path).collect()
        };

        Ok(Self {
            files,
            likes,
            pos: 0,
            last_mode: None,
            last_before: None,
            last_offset: None,
        })
    }

    fn empty(likes: bool) -> Self {
        Self {
            files: Vec::new(),
            likes,
            pos: 0,
            last_mode: None,
            last_before: None,
            last_offset: None,
        }
    }

    fn enter_mode(&mut self, mode: Mode) {
        assert!(
            self.last_mode.is_none() || self.last_mode == Some(mode),
            "replay paging switched from {:?} to {:?}",
            self.last_mode,
            mode
        );
        self.last_mode = Some(mode);
    }

    /// Reads forward until `count` documents are collected
    fn take(&mut self, count: usize, before: Option<i64>) -> Vec<Value> {
        let date_key = if self.likes { "liked_timestamp" } else { "timestamp" };
        let mut posts = Vec::new();
        while posts.len() < count && self.pos < self.files.len() {
            let path = &self.files[self.pos];
            self.pos += 1;
            let Some(doc) = read_doc(path) else {
                continue; // logged; skip the corrupt file
            };
            if let Some(bound) = before {
                let date = doc.get(date_key).and_then(Value::as_i64).unwrap_or(0);
                if date >= bound {
                    continue;
                }
            }
            posts.push(doc);
        }
        posts
    }
}

impl PostSource for ReplaySource {
    fn get_initial(&mut self) -> Result<Option<Meta>> {
        let Some(first) = self.files.first().and_then(|path| read_doc(path)) else {
            return Ok(None);
        };
        let blog = first.get("blog").cloned().unwrap_or_default();
        Ok(Some(Meta {
            title: blog.get("title").and_then(Value::as_str).map(str::to_string),
            description: blog
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            count_estimate: Some(self.files.len() as u64),
            share_likes: None,
        }))
    }

    fn fetch(&mut self, count: usize, args: FetchArgs) -> Result<Option<Batch>> {
        let posts = match args {
            FetchArgs::Ident(_) => {
                self.enter_mode(Mode::Ident);
                // Idents are pre-resolved; deliver the next one
                let posts = self.take(1, None);
                if posts.is_empty() {
                    return Ok(None);
                }
                posts
            }
            FetchArgs::Before(before) => {
                self.enter_mode(Mode::Before);
                assert!(
                    self.last_before.is_none_or(|last| before < last),
                    "replay 'before' bound did not decrease: {} then {}",
                    self.last_before.unwrap_or_default(),
                    before
                );
                self.last_before = Some(before);
                self.take(count, Some(before))
            }
            FetchArgs::Start(start) => {
                self.enter_mode(Mode::Offset);
                let expected = self.last_offset.map_or(0, |last| last + MAX_POSTS);
                assert!(
                    start == expected,
                    "replay offset skipped: expected {}, got {}",
                    expected,
                    start
                );
                self.last_offset = Some(start);
                self.take(count, None)
            }
        };
        Ok(Some(Batch {
            posts,
            next_before: None,
        }))
    }
}

fn read_doc(path: &Path) -> Option<Value> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::error!("{}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(doc) => Some(doc),
        Err(e) => {
            tracing::error!("{}: invalid JSON: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_doc(root: &Path, ident: u64, timestamp: i64, liked: i64) {
        let dir = root.join("json");
        std::fs::create_dir_all(&dir).unwrap();
        let doc = serde_json::json!({
            "id": ident,
            "timestamp": timestamp,
            "liked_timestamp": liked,
            "type": "text",
            "blog": {"title": "Example", "description": "d"},
        });
        std::fs::write(dir.join(format!("{}.json", ident)), doc.to_string()).unwrap();
    }

    fn ids(batch: &Batch) -> Vec<u64> {
        batch
            .posts
            .iter()
            .map(|p| p["id"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_sorted_descending_by_id() {
        let dir = tempdir().unwrap();
        write_doc(dir.path(), 10, 100, 0);
        write_doc(dir.path(), 30, 300, 0);
        write_doc(dir.path(), 20, 200, 0);

        let mut src = ReplaySource::new(dir.path(), false, None).unwrap();
        let batch = src.fetch(50, FetchArgs::Start(0)).unwrap().unwrap();
        assert_eq!(ids(&batch), vec![30, 20, 10]);
    }

    #[test]
    fn test_sorted_descending_by_liked_timestamp() {
        let dir = tempdir().unwrap();
        // id order and liked order disagree
        write_doc(dir.path(), 1, 100, 500);
        write_doc(dir.path(), 2, 200, 300);
        write_doc(dir.path(), 3, 300, 400);

        let mut src = ReplaySource::new(dir.path(), true, None).unwrap();
        let batch = src.fetch(50, FetchArgs::Start(0)).unwrap().unwrap();
        assert_eq!(ids(&batch), vec![1, 3, 2]);
    }

    #[test]
    fn test_offset_paging() {
        let dir = tempdir().unwrap();
        for i in 1..=120 {
            write_doc(dir.path(), i, i as i64, 0);
        }
        let mut src = ReplaySource::new(dir.path(), false, None).unwrap();
        let first = src.fetch(MAX_POSTS, FetchArgs::Start(0)).unwrap().unwrap();
        assert_eq!(first.posts.len(), 50);
        let second = src.fetch(MAX_POSTS, FetchArgs::Start(50)).unwrap().unwrap();
        assert_eq!(second.posts.len(), 50);
        let third = src.fetch(MAX_POSTS, FetchArgs::Start(100)).unwrap().unwrap();
        assert_eq!(third.posts.len(), 20);
        let empty = src.fetch(MAX_POSTS, FetchArgs::Start(150)).unwrap().unwrap();
        assert!(empty.posts.is_empty());
    }

    #[test]
    fn test_before_paging_filters_by_timestamp() {
        let dir = tempdir().unwrap();
        write_doc(dir.path(), 3, 300, 0);
        write_doc(dir.path(), 2, 200, 0);
        write_doc(dir.path(), 1, 100, 0);

        let mut src = ReplaySource::new(dir.path(), false, None).unwrap();
        let batch = src.fetch(50, FetchArgs::Before(300)).unwrap().unwrap();
        assert_eq!(ids(&batch), vec![2, 1]);
    }

    #[test]
    #[should_panic(expected = "did not decrease")]
    fn test_before_must_strictly_decrease() {
        let dir = tempdir().unwrap();
        write_doc(dir.path(), 1, 100, 0);
        let mut src = ReplaySource::new(dir.path(), false, None).unwrap();
        let _ = src.fetch(50, FetchArgs::Before(200));
        let _ = src.fetch(50, FetchArgs::Before(200));
    }

    #[test]
    #[should_panic(expected = "switched")]
    fn test_mode_switch_is_contract_violation() {
        let dir = tempdir().unwrap();
        write_doc(dir.path(), 1, 100, 0);
        let mut src = ReplaySource::new(dir.path(), false, None).unwrap();
        let _ = src.fetch(50, FetchArgs::Start(0));
        let _ = src.fetch(50, FetchArgs::Before(50));
    }

    #[test]
    fn test_explicit_idents_resolved_up_front() {
        let dir = tempdir().unwrap();
        write_doc(dir.path(), 5, 100, 0);
        write_doc(dir.path(), 7, 200, 0);

        let mut src = ReplaySource::new(dir.path(), false, Some(&[7, 5])).unwrap();
        let first = src.fetch(1, FetchArgs::Ident(7)).unwrap().unwrap();
        assert_eq!(ids(&first), vec![7]);
        let second = src.fetch(1, FetchArgs::Ident(5)).unwrap().unwrap();
        assert_eq!(ids(&second), vec![5]);
        assert!(src.fetch(1, FetchArgs::Ident(3)).unwrap().is_none());
    }

    #[test]
    fn test_missing_ident_fails_up_front() {
        let dir = tempdir().unwrap();
        write_doc(dir.path(), 5, 100, 0);
        let err = ReplaySource::new(dir.path(), false, Some(&[6])).unwrap_err();
        assert!(matches!(err, VaultError::PostNotFound(6)));
    }

    #[test]
    fn test_get_initial_reads_blog_meta() {
        let dir = tempdir().unwrap();
        write_doc(dir.path(), 1, 100, 0);
        let mut src = ReplaySource::new(dir.path(), false, None).unwrap();
        let meta = src.get_initial().unwrap().unwrap();
        assert_eq!(meta.title.as_deref(), Some("Example"));
        assert_eq!(meta.count_estimate, Some(1));
    }

    #[test]
    fn test_empty_archive() {
        let dir = tempdir().unwrap();
        let mut src = ReplaySource::new(dir.path(), false, None).unwrap();
        assert!(src.get_initial().unwrap().is_none());
    }
}

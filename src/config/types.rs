use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Options that must match the archive's first-run snapshot when reusing a
/// previous archive as a media source
pub const PREV_MUST_MATCH_OPTIONS: &[&str] = &["likes"];

/// Options that determine the shape of saved media paths
pub const MEDIA_PATH_OPTIONS: &[&str] = &["dirs", "hostdirs", "image_names"];

/// Options that must always match a prior archive, unconditionally
pub const MUST_MATCH_OPTIONS: &[&str] = &["likes", "dirs", "hostdirs", "image_names"];

/// Options that change which posts a backup pass produces; mismatches are
/// tolerated only when explicitly resuming with `--ignore-diffopt`
pub const BACKUP_CHANGING_OPTIONS: &[&str] = &[
    "save_images",
    "save_video",
    "save_audio",
    "save_notes",
    "notes_limit",
    "save_json",
    "count",
    "skip",
    "period",
    "request",
    "filter",
    "no_reblog",
    "only_reblog",
    "prev_archive",
    "user_agent",
    "no_get",
    "media_list",
    "idents",
    "reuse_json",
];

/// How downloaded image files are named
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ImageNames {
    /// Keep the file name from the URL
    #[default]
    Original,
    /// `<post id><offset>.<ext>`
    PostId,
    /// `<blog name>_<post id><offset>.<ext>`
    BlogPostId,
}

/// A type-and-tags request filter: post type (or "any") mapped to the set of
/// tags (possibly containing the any-tag marker) that admit it
pub type RequestFilter = BTreeMap<String, BTreeSet<String>>;

/// Matches any post type in a request filter
pub const TYPE_ANY: &str = "any";

/// Matches any tag in a request filter
pub const TAG_ANY: &str = "__all__";

/// The full option set one backup pass runs with
///
/// The struct is serialized as the `.first_run_options` snapshot of a fresh
/// archive; field names double as the option keys in compatibility diffs, so
/// renaming a field here is a format change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    // Path-shape options (must always match a prior archive)
    pub likes: bool,
    pub dirs: bool,
    pub hostdirs: bool,
    pub image_names: ImageNames,

    // Backup-changing options
    pub save_images: bool,
    pub save_video: bool,
    pub save_audio: bool,
    pub save_notes: bool,
    pub notes_limit: Option<u32>,
    pub save_json: bool,
    pub count: Option<usize>,
    pub skip: usize,
    /// Half-open `[start, end)` timestamp range
    pub period: Option<(i64, i64)>,
    pub request: Option<RequestFilter>,
    pub filter: Option<String>,
    pub no_reblog: bool,
    pub only_reblog: bool,
    pub prev_archive: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub no_get: bool,
    pub media_list: bool,
    pub idents: Option<Vec<u64>>,
    pub reuse_json: bool,

    // Display options
    pub tag_index: bool,
    pub posts_per_page: usize,

    // Run-control options (never snapshotted against, but recorded)
    pub incremental: bool,
    pub resume: bool,
    pub ignore_diffopt: bool,
    pub no_post_clobber: bool,
    pub threads: usize,
    pub outdir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            likes: false,
            dirs: false,
            hostdirs: false,
            image_names: ImageNames::Original,
            save_images: false,
            save_video: false,
            save_audio: false,
            save_notes: false,
            notes_limit: None,
            save_json: false,
            count: None,
            skip: 0,
            period: None,
            request: None,
            filter: None,
            no_reblog: false,
            only_reblog: false,
            prev_archive: None,
            user_agent: None,
            no_get: false,
            media_list: false,
            idents: None,
            reuse_json: false,
            tag_index: false,
            posts_per_page: 50,
            incremental: false,
            resume: false,
            ignore_diffopt: false,
            no_post_clobber: false,
            threads: 20,
            outdir: None,
        }
    }
}

impl Options {
    /// Returns the options as a JSON object, keyed by field name
    ///
    /// Used for snapshot writes and for compatibility diffs against a prior
    /// snapshot.
    pub fn to_snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// Looks up a single option by its snapshot key
    pub fn get(&self, key: &str) -> serde_json::Value {
        self.to_snapshot()
            .remove(key)
            .unwrap_or(serde_json::Value::Null)
    }

    /// Overwrites a single option from a snapshot value, if the key is known
    pub fn set(&mut self, key: &str, value: serde_json::Value) {
        let mut map = self.to_snapshot();
        map.insert(key.to_string(), value);
        if let Ok(opts) = serde_json::from_value(serde_json::Value::Object(map)) {
            *self = opts;
        }
    }

    /// The file extension for saved posts
    pub fn post_ext(&self) -> &'static str {
        if self.dirs {
            ""
        } else {
            ".html"
        }
    }

    /// The sort key of a raw post document: id, or liked timestamp in likes
    /// mode
    pub fn sort_key(&self, post: &serde_json::Value) -> i64 {
        if self.likes {
            post.get("liked_timestamp")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0)
        } else {
            post.get("id")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0)
        }
    }
}

//! On-disk archive layout and state
//!
//! An archive is one directory per blog: rendered posts under `posts/`,
//! media under `media/` (or inside each post's directory in dirs mode), raw
//! API documents under `json/`, monthly pages under `archive/`, plus a few
//! markers at the root (`.complete`, `.first_run_options`, `media.json`).
//!
//! The file tree itself is the archive state; there is no separate index.
//! Resume points are recomputed by scanning it.

pub mod media;
pub mod state;
pub mod write;

pub use media::{DownloadRegistry, MediaDownloader};
pub use state::MediaLog;
pub use write::{is_disk_full, write_atomic, write_marker_durable};

use std::path::{Path, PathBuf};

use crate::config::Options;

pub const POST_DIR: &str = "posts";
pub const MEDIA_DIR: &str = "media";
pub const JSON_DIR: &str = "json";
pub const ARCHIVE_DIR: &str = "archive";
pub const THEME_DIR: &str = "theme";
pub const TAG_INDEX_DIR: &str = "tags";

pub const DIR_INDEX_FILENAME: &str = "index.html";
pub const BACKUP_CSS_FILENAME: &str = "backup.css";
pub const CUSTOM_CSS_FILENAME: &str = "custom.css";
pub const AVATAR_BASE: &str = "avatar";

pub const COMPLETE_MARKER: &str = ".complete";
pub const FIRST_RUN_OPTIONS: &str = ".first_run_options";
pub const MEDIA_LIST_FILENAME: &str = "media.json";

/// Path derivation for one blog archive
///
/// A post's identity maps deterministically to one relative path: flat
/// `posts/<id>.html`, or `posts/<id>/index.html` in dirs mode (where the
/// post's media also lives beside its index file).
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    dirs: bool,
}

impl Layout {
    pub fn new(root: PathBuf, options: &Options) -> Self {
        Self {
            root,
            dirs: options.dirs,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative path of a post file
    pub fn post_rel(&self, ident: u64) -> PathBuf {
        if self.dirs {
            [POST_DIR, &ident.to_string(), DIR_INDEX_FILENAME]
                .iter()
                .collect()
        } else {
            Path::new(POST_DIR).join(format!("{}.html", ident))
        }
    }

    pub fn post_path(&self, ident: u64) -> PathBuf {
        self.root.join(self.post_rel(ident))
    }

    pub fn json_path(&self, ident: u64) -> PathBuf {
        self.root.join(JSON_DIR).join(format!("{}.json", ident))
    }

    /// Relative directory a post's media is saved under
    pub fn media_dir_rel(&self, ident: u64) -> PathBuf {
        if self.dirs {
            Path::new(POST_DIR).join(ident.to_string())
        } else {
            PathBuf::from(MEDIA_DIR)
        }
    }

    /// Href from a post file to its media directory
    pub fn media_href(&self, ident: u64) -> String {
        if self.dirs {
            // posts/<id>/index.html sits beside its media
            ".".to_string()
        } else {
            format!("../{}", MEDIA_DIR)
        }
    }

    /// Href from a post file back to the archive root
    pub fn root_href(&self) -> &'static str {
        if self.dirs {
            "../.."
        } else {
            ".."
        }
    }

    /// Href from the root index to a post file
    pub fn post_href(&self, ident: u64) -> String {
        if self.dirs {
            format!("{}/{}/{}", POST_DIR, ident, DIR_INDEX_FILENAME)
        } else {
            format!("{}/{}.html", POST_DIR, ident)
        }
    }

    pub fn complete_marker(&self) -> PathBuf {
        self.root.join(COMPLETE_MARKER)
    }

    pub fn first_run_options_path(&self) -> PathBuf {
        self.root.join(FIRST_RUN_OPTIONS)
    }

    pub fn media_list_path(&self) -> PathBuf {
        self.root.join(MEDIA_LIST_FILENAME)
    }

    pub fn theme_dir(&self) -> PathBuf {
        self.root.join(THEME_DIR)
    }

    pub fn json_dir(&self) -> PathBuf {
        self.root.join(JSON_DIR)
    }

    /// All saved post files, in directory order
    pub fn find_post_files(&self) -> Vec<PathBuf> {
        let post_root = self.root.join(POST_DIR);
        let Ok(entries) = std::fs::read_dir(&post_root) else {
            return Vec::new(); // nonexistent dir: empty archive
        };

        let mut files = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if self.dirs {
                let index = path.join(DIR_INDEX_FILENAME);
                if index.is_file() {
                    files.push(index);
                }
            } else if path.extension().is_some_and(|e| e == "html") {
                files.push(path);
            }
        }
        files
    }

    /// The post id a saved file belongs to, derived from its path
    pub fn post_id_of(&self, path: &Path) -> Option<u64> {
        let stem = if self.dirs {
            path.parent()?.file_name()?
        } else {
            path.file_stem()?
        };
        stem.to_str()?.parse().ok()
    }
}

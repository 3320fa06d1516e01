//! Media download and deduplication
//!
//! Media files are shared state between workers: two posts can reference
//! the same URL, and a resumed run can reference files a previous run (or a
//! previous archive) already saved. The rules are: never clobber an
//! existing file, copy from the previous archive before hitting the
//! network, and never let two workers download to the same destination at
//! once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use url::Url;

use crate::archive::{write_atomic, Layout};
use crate::backup::coord::{Coord, FaultKind};
use crate::config::{ImageNames, Options};
use crate::Result;

const DOWNLOAD_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// The path-shape options media paths depend on
///
/// A previous archive may have been made with a different shape; probing it
/// for reusable files uses its own recorded options, not ours.
#[derive(Debug, Clone)]
pub struct MediaPathOptions {
    pub dirs: bool,
    pub hostdirs: bool,
    pub image_names: ImageNames,
}

impl MediaPathOptions {
    pub fn from_options(options: &Options) -> Self {
        Self {
            dirs: options.dirs,
            hostdirs: options.hostdirs,
            image_names: options.image_names,
        }
    }

    /// Reads the media path options out of an archive's option snapshot,
    /// falling back to the given defaults for missing keys
    pub fn from_snapshot(
        snapshot: &serde_json::Map<String, serde_json::Value>,
        fallback: &Self,
    ) -> Self {
        Self {
            dirs: snapshot
                .get("dirs")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(fallback.dirs),
            hostdirs: snapshot
                .get("hostdirs")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(fallback.hostdirs),
            image_names: snapshot
                .get("image_names")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or(fallback.image_names),
        }
    }
}

/// The set of destination paths currently being downloaded
///
/// Guarded by its own lock and condvar, separate from the pool's
/// coordination lock: a worker waiting here blocks only on the one
/// duplicate download, nothing else.
#[derive(Default)]
pub struct DownloadRegistry {
    set: Mutex<HashSet<PathBuf>>,
    cond: Condvar,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a destination path, waiting out any in-flight download to it
    pub fn acquire(&self, path: PathBuf) -> DownloadToken<'_> {
        let mut set = self.set.lock().unwrap();
        while set.contains(&path) {
            set = self.cond.wait(set).unwrap();
        }
        set.insert(path.clone());
        DownloadToken {
            registry: self,
            path,
        }
    }

    #[cfg(test)]
    fn holds(&self, path: &Path) -> bool {
        self.set.lock().unwrap().contains(path)
    }
}

/// Releases the claimed path on drop and wakes waiters
pub struct DownloadToken<'a> {
    registry: &'a DownloadRegistry,
    path: PathBuf,
}

impl Drop for DownloadToken<'_> {
    fn drop(&mut self) {
        let mut set = self.registry.set.lock().unwrap();
        set.remove(&self.path);
        self.registry.cond.notify_all();
    }
}

/// Downloads media files into the archive
pub struct MediaDownloader {
    client: reqwest::blocking::Client,
    registry: DownloadRegistry,
    coord: Arc<Coord>,
    layout: Layout,
    options: MediaPathOptions,
    prev_archive: Option<(PathBuf, MediaPathOptions)>,
    no_get: bool,
}

/// One media download request
pub struct MediaRequest<'a> {
    pub url: &'a str,
    pub ident: u64,
    pub blog: &'a str,
    /// `_o<N>` photoset suffix, empty otherwise
    pub offset: String,
    /// Forced extension (Tumblr audio/video URLs have none)
    pub extension: Option<&'a str>,
    /// Explicit file name (inline images keep their URL basename)
    pub filename: Option<&'a str>,
}

impl MediaDownloader {
    pub fn new(
        client: reqwest::blocking::Client,
        coord: Arc<Coord>,
        layout: Layout,
        options: &Options,
        prev_archive: Option<(PathBuf, MediaPathOptions)>,
    ) -> Self {
        Self {
            client,
            registry: DownloadRegistry::new(),
            coord,
            layout,
            options: MediaPathOptions::from_options(options),
            prev_archive,
            no_get: options.no_get,
        }
    }

    /// Fetches one media file if it is not already present
    ///
    /// Returns the saved path relative to the post's media directory, or
    /// `None` when the URL is unusable or the download failed softly.
    /// Out-of-space errors propagate so the worker can raise the disk-full
    /// signal and retry.
    pub fn download(&self, req: &MediaRequest<'_>) -> Result<Option<String>> {
        let Ok(parsed) = Url::parse(req.url) else {
            return Ok(None);
        };
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Ok(None); // this URL does not follow our basic assumptions
        }

        let Some(rel) = self.rel_path(&parsed, req, &self.options) else {
            return Ok(None);
        };
        let dest = self.layout.root().join(self.layout.media_dir_rel(req.ident)).join(&rel);

        // Prevent racing of existence check and download
        let _token = self.registry.acquire(dest.clone());

        let copied = self.copy_from_prev_archive(&parsed, req, &dest)?;
        if !copied && !dest.exists() {
            if self.no_get {
                return Ok(None);
            }
            if !self.fetch_to(req.url, &dest)? {
                return Ok(None);
            }
        }

        Ok(rel.to_str().map(str::to_string))
    }

    /// The saved file's path relative to the media directory
    fn rel_path(
        &self,
        parsed: &Url,
        req: &MediaRequest<'_>,
        options: &MediaPathOptions,
    ) -> Option<PathBuf> {
        let fname = match req.filename {
            Some(f) => f.to_string(),
            None => {
                let mut fname = media_filename(parsed, options.image_names, req.blog, req.ident, &req.offset)?;
                if let Some(ext) = req.extension {
                    let stem = fname.rsplit_once('.').map_or(fname.as_str(), |(s, _)| s);
                    fname = format!("{}{}", stem, ext);
                }
                fname
            }
        };
        if options.hostdirs {
            Some(Path::new(&host_dir(parsed)).join(fname))
        } else {
            Some(PathBuf::from(fname))
        }
    }

    /// Copies the file from the previous archive if it has it
    fn copy_from_prev_archive(
        &self,
        parsed: &Url,
        req: &MediaRequest<'_>,
        dest: &Path,
    ) -> Result<bool> {
        let Some((prev_root, prev_options)) = &self.prev_archive else {
            return Ok(false);
        };
        if dest.exists() {
            return Ok(true); // don't overwrite
        }

        let prev_media_dir = if prev_options.dirs {
            Path::new(super::POST_DIR).join(req.ident.to_string())
        } else {
            PathBuf::from(super::MEDIA_DIR)
        };
        let Some(rel) = self.rel_path(parsed, req, prev_options) else {
            return Ok(false);
        };
        let src = prev_root.join(prev_media_dir).join(rel);
        if !src.exists() {
            return Ok(false);
        }

        if let Some(dir) = dest.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = tempfile::Builder::new()
            .prefix(".media.")
            .tempfile_in(dest.parent().unwrap_or_else(|| Path::new(".")))?;
        std::fs::copy(&src, tmp.path())?;
        tmp.persist(dest).map_err(|e| e.error)?;
        Ok(true)
    }

    /// Downloads `url` to `dest`; `Ok(false)` is a soft failure
    fn fetch_to(&self, url: &str, dest: &Path) -> Result<bool> {
        let mut attempts = 0;
        loop {
            match self.try_fetch(url) {
                Ok(Some(bytes)) => {
                    write_atomic(dest, &bytes)?;
                    return Ok(true);
                }
                Ok(None) => return Ok(false),
                Err(e) => {
                    if (e.is_connect() || e.is_timeout())
                        && !self.coord.is_destroyed()
                        && !self.coord.probe_healthy(FaultKind::NoInternet)
                    {
                        // Process-wide outage: block with everyone else, then retry
                        self.coord.raise(FaultKind::NoInternet);
                        continue;
                    }
                    attempts += 1;
                    if attempts >= DOWNLOAD_ATTEMPTS {
                        tracing::warn!("Failed to download {}: {}", url, e);
                        return Ok(false);
                    }
                    std::thread::sleep(RETRY_DELAY);
                }
            }
        }
    }

    fn try_fetch(&self, url: &str) -> reqwest::Result<Option<Vec<u8>>> {
        let resp = self.client.get(url).send()?;
        let status = resp.status();
        if !status.is_success() {
            tracing::warn!("HTTP {} downloading {}", status.as_u16(), url);
            return Ok(None);
        }
        Ok(Some(resp.bytes()?.to_vec()))
    }
}

/// A sane directory name representing the URL's host
fn host_dir(parsed: &Url) -> String {
    let mut host = parsed.host_str().unwrap_or_default().to_string();
    if let Some(port) = parsed.port() {
        host = format!("{}:{}", host, port);
    }
    host
}

/// Determines the media file name depending on the image-names option
pub fn media_filename(
    parsed: &Url,
    image_names: ImageNames,
    blog: &str,
    ident: u64,
    offset: &str,
) -> Option<String> {
    let basename = parsed
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())?;

    let (stem, ext) = match basename.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{}", ext)),
        None => (basename, String::new()),
    };

    Some(match image_names {
        ImageNames::PostId => format!("{}{}{}", ident, offset, ext),
        ImageNames::BlogPostId => format!("{}_{}{}{}", blog, ident, offset, ext),
        ImageNames::Original => match parsed.query() {
            // Insert the query string to avoid ambiguity for certain URLs
            // (e.g. SoundCloud embeds)
            Some(query) => format!("{}?{}{}", stem, query, ext),
            None => basename.to_string(),
        },
    })
}

/// Rewrites a Tumblr image URL to its 1280px variant
pub fn maxsize_image_url(url: &str) -> String {
    if !url.contains(".tumblr.com/") || url.ends_with(".gif") {
        return url.to_string();
    }
    let Some(dot) = url.rfind('.') else {
        return url.to_string();
    };
    let (head, ext) = url.split_at(dot);
    if !ext[1..].bytes().all(|b| b.is_ascii_alphanumeric()) {
        return url.to_string();
    }
    let Some(us) = head.rfind('_') else {
        return url.to_string();
    };
    let digits = &head[us + 1..];
    if (2..=4).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit()) {
        format!("{}_1280{}", &head[..us], ext)
    } else {
        url.to_string()
    }
}

//! Best-effort note scraping
//!
//! Notes are not part of the API response; they are scraped from the
//! post's public page. The scrape runs in an isolated worker thread that
//! streams log lines and a result back over a channel, with an explicit
//! outcome: notes found, blocked by the site's safe-mode policy, or no
//! connectivity. Policy blocks disable scraping for the whole blog;
//! connectivity loss raises the process-wide signal and retries. Nothing
//! here ever fails a post.

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use scraper::{Html, Selector};

use crate::backup::coord::{Coord, FaultKind};

/// How one scrape attempt ended
#[derive(Debug)]
pub enum NotesOutcome {
    /// The notes list's inner HTML; empty when the post has none
    Done(String),
    /// Safe mode is blocking us; stop scraping this blog
    BlockedByPolicy,
    /// Connectivity dropped mid-scrape
    NoConnectivity,
}

/// A log line relayed from the scrape worker
enum WorkerMsg {
    Info(String),
    Warn(String),
}

/// Scrapes post notes, remembering which blogs refuse us
pub struct NoteScraper {
    client: reqwest::blocking::Client,
    coord: Arc<Coord>,
    notes_limit: Option<u32>,
    disabled: Mutex<HashSet<String>>,
}

impl NoteScraper {
    pub fn new(
        client: reqwest::blocking::Client,
        coord: Arc<Coord>,
        notes_limit: Option<u32>,
    ) -> Self {
        Self {
            client,
            coord,
            notes_limit,
            disabled: Mutex::new(HashSet::new()),
        }
    }

    /// Marks a blog as not scrapable (e.g. dashboard-only blogs)
    pub fn disable_for(&self, account: &str) {
        let mut disabled = self.disabled.lock().unwrap();
        if disabled.insert(account.to_string()) {
            tracing::info!("[note scraper] scraping disabled for {}", account);
        }
    }

    /// Fetches the notes of one post; `None` when scraping is disabled or
    /// nothing was found
    pub fn scrape(&self, account: &str, post_url: &str, ident: u64) -> Option<String> {
        if self.disabled.lock().unwrap().contains(account) {
            return None;
        }

        loop {
            let outcome = self.run_worker(post_url, ident);
            match outcome {
                NotesOutcome::Done(html) if html.trim().is_empty() => return None,
                NotesOutcome::Done(html) => return Some(html),
                NotesOutcome::BlockedByPolicy => {
                    let mut disabled = self.disabled.lock().unwrap();
                    // Check if another thread already set this
                    if disabled.insert(account.to_string()) {
                        tracing::info!(
                            "[note scraper] blocked by safe mode - scraping disabled for {}",
                            account
                        );
                    }
                    return None;
                }
                NotesOutcome::NoConnectivity => {
                    self.coord.raise(FaultKind::NoInternet);
                    // Signal cleared (or destroyed); try once more
                    if self.coord.is_destroyed() {
                        return None;
                    }
                }
            }
        }
    }

    /// Runs one scrape attempt on its own thread, draining its log stream
    fn run_worker(&self, post_url: &str, ident: u64) -> NotesOutcome {
        let (tx, rx) = mpsc::channel::<WorkerMsg>();
        let client = self.client.clone();
        let url = post_url.to_string();
        let limit = self.notes_limit;

        let handle = std::thread::Builder::new()
            .name(format!("notes-{}", ident))
            .spawn(move || scrape_worker(&client, &url, ident, limit, &tx));

        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("[note scraper] failed to spawn worker: {}", e);
                return NotesOutcome::Done(String::new());
            }
        };

        // The sender side drops when the worker finishes
        for msg in rx {
            match msg {
                WorkerMsg::Info(line) => tracing::info!("[note scraper] {}", line),
                WorkerMsg::Warn(line) => tracing::warn!("[note scraper] {}", line),
            }
        }
        match handle.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!("[note scraper] worker panicked for post {}", ident);
                NotesOutcome::Done(String::new())
            }
        }
    }
}

fn scrape_worker(
    client: &reqwest::blocking::Client,
    url: &str,
    ident: u64,
    limit: Option<u32>,
    log: &mpsc::Sender<WorkerMsg>,
) -> NotesOutcome {
    let _ = log.send(WorkerMsg::Info(format!("getting notes for post {}", ident)));

    let resp = match client.get(url).send() {
        Ok(resp) => resp,
        Err(e) if e.is_connect() || e.is_timeout() => return NotesOutcome::NoConnectivity,
        Err(e) => {
            let _ = log.send(WorkerMsg::Warn(format!("post {}: {}", ident, e)));
            return NotesOutcome::Done(String::new());
        }
    };

    // Safe mode bounces the request to an interstitial
    if resp.url().path().contains("safe-mode") {
        return NotesOutcome::BlockedByPolicy;
    }
    if !resp.status().is_success() {
        let _ = log.send(WorkerMsg::Warn(format!(
            "post {}: HTTP {}",
            ident,
            resp.status().as_u16()
        )));
        return NotesOutcome::Done(String::new());
    }

    let body = match resp.text() {
        Ok(body) => body,
        Err(_) => return NotesOutcome::Done(String::new()),
    };

    NotesOutcome::Done(extract_notes(&body, limit))
}

/// Pulls the notes list items out of a post page
fn extract_notes(body: &str, limit: Option<u32>) -> String {
    let doc = Html::parse_document(body);
    let Ok(list) = Selector::parse("ol.notes > li") else {
        return String::new();
    };
    let mut html = String::new();
    for (n, li) in doc.select(&list).enumerate() {
        if limit.is_some_and(|limit| n as u32 >= limit) {
            break;
        }
        html.push_str(&li.html());
        html.push('\n');
    }
    html
}

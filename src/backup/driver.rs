//! The backup driver loop
//!
//! Pages through a response source, reconciles against the archive on
//! disk, filters each batch, and feeds the surviving posts to the worker
//! pool with backpressure. One driver handles any number of targets; a
//! fatal error aborts only the target that raised it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::media::MediaDownloader;
use crate::archive::state::{self, MediaLog};
use crate::archive::{Layout, CUSTOM_CSS_FILENAME};
use crate::backup::coord::Coord;
use crate::backup::notes::NoteScraper;
use crate::backup::pool::ThreadPool;
use crate::backup::prefetch::ApiThread;
use crate::backup::reconcile;
use crate::config::{parse_filter, Options, TAG_ANY, TYPE_ANY};
use crate::post::PostRecord;
use crate::render::{index, page_header, xml_escape, Blog, PostRenderer};
use crate::source::{
    build_client, FetchArgs, FetchRequest, LiveSource, PostSource, ReplaySource, MAX_POSTS,
};
use crate::{Result, VaultError};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_NOPOSTS: i32 = 1;
pub const EXIT_INTERRUPT: i32 = 3;
pub const EXIT_ERRORS: i32 = 4;

/// Drives backups for all requested targets and accounts for the outcome
pub struct BackupDriver {
    options: Options,
    api_key: String,
    output_root: PathBuf,
    pub failed_blogs: Vec<String>,
    pub postfail_blogs: Vec<String>,
    pub total_count: usize,
}

impl BackupDriver {
    pub fn new(options: Options, api_key: String, output_root: PathBuf) -> Self {
        Self {
            options,
            api_key,
            output_root,
            failed_blogs: Vec::new(),
            postfail_blogs: Vec::new(),
            total_count: 0,
        }
    }

    /// Backs up every requested blog; returns the process exit code
    pub fn run(&mut self, blogs: &[String], prev_archives: &[PathBuf]) -> i32 {
        for (n, account) in blogs.iter().enumerate() {
            let prev = prev_archives.get(n).map(PathBuf::as_path);
            match self.backup(account, prev) {
                Ok(()) => {}
                Err(VaultError::Interrupted) => return EXIT_INTERRUPT,
                Err(e) => {
                    tracing::error!("{}: {}", account, e);
                    if !self.failed_blogs.iter().any(|b| b.as_str() == account) {
                        self.failed_blogs.push(account.clone());
                    }
                }
            }
        }

        if !self.failed_blogs.is_empty() {
            tracing::warn!("Failed to back up {}", self.failed_blogs.join(", "));
        }
        if !self.postfail_blogs.is_empty() {
            tracing::warn!(
                "One or more posts failed to save for {}",
                self.postfail_blogs.join(", ")
            );
        }
        self.exit_code()
    }

    pub fn exit_code(&self) -> i32 {
        if !self.failed_blogs.is_empty() || !self.postfail_blogs.is_empty() {
            EXIT_ERRORS
        } else if self.total_count == 0 {
            EXIT_NOPOSTS
        } else {
            EXIT_SUCCESS
        }
    }

    fn save_root(&self, account: &str, options: &Options) -> PathBuf {
        match &options.outdir {
            Some(outdir) if outdir.is_absolute() => outdir.clone(),
            Some(outdir) => self.output_root.join(outdir),
            None => self.output_root.join(account),
        }
    }

    /// Makes single files and an index for every post of one blog
    pub fn backup(&mut self, account: &str, prev_archive: Option<&Path>) -> Result<()> {
        let mut options = self.options.clone();
        let save_root = self.save_root(account, &options);
        let layout = Layout::new(save_root.clone(), &options);

        let plan = reconcile::plan(account, &layout, &mut options, &self.options, prev_archive)?;

        let client = build_client(options.user_agent.as_deref())?;
        let coord = Coord::for_archive(save_root);

        let source: Box<dyn PostSource> = if options.reuse_json {
            Box::new(ReplaySource::new(
                layout.root(),
                options.likes,
                options.idents.as_deref(),
            )?)
        } else if let Some(prev) = prev_archive {
            Box::new(ReplaySource::new(prev, options.likes, options.idents.as_deref())?)
        } else {
            Box::new(LiveSource::new(
                client.clone(),
                coord.clone(),
                account,
                self.api_key.clone(),
                options.likes,
            )?)
        };

        self.run_target(account, prev_archive, options, plan, layout, client, coord, source)
    }

    /// The driver loop proper, against an arbitrary source
    #[allow(clippy::too_many_arguments)]
    pub fn run_target(
        &mut self,
        account: &str,
        prev_archive: Option<&Path>,
        mut options: Options,
        plan: reconcile::Plan,
        layout: Layout,
        client: reqwest::blocking::Client,
        coord: Arc<Coord>,
        mut source: Box<dyn PostSource>,
    ) -> Result<()> {
        let likes = options.likes;
        let mut post_count = 0usize;
        let mut filter_skipped = 0usize;

        if let Some(idents) = &mut options.idents {
            idents.sort_unstable();
            idents.reverse();
        }
        let ident_max = if options.incremental {
            reconcile::incremental_bound(&layout, &options, account)?
        } else {
            None
        };
        if options.resume {
            // Do not count or re-fetch posts that were already backed up
            options.skip = 0;
            post_count = layout.find_post_files().len();
        }

        tracing::debug!("{}: getting basic information", account);
        let Some(meta) = source.get_initial()? else {
            self.failed_blogs.push(account.to_string());
            return Ok(());
        };
        if likes && meta.share_likes == Some(false) {
            tracing::error!("{} does not have public likes", account);
            self.failed_blogs.push(account.to_string());
            return Ok(());
        }

        let blog = Blog {
            account: account.to_string(),
            name: if account.contains('.') {
                account.to_string()
            } else {
                format!("{}.tumblr.com", account)
            },
            title: xml_escape(meta.title.as_deref().unwrap_or(account)),
            subtitle: meta.description.clone().unwrap_or_default(),
        };
        let count_estimate = match &options.idents {
            Some(idents) => Some(idents.len() as u64),
            None => meta.count_estimate,
        };

        if options.count == Some(0) {
            // A count-limited-to-zero pass only rebuilds the indices
            return index::finalize(&layout, &client, &blog, &options, prev_archive, false);
        }

        if plan.write_first_run_options {
            // Blog directory gets created here
            state::write_first_run_options(&layout, &self.options)?;
        }

        let dashboard_only = source.dashboard_only();
        let mut before: Option<i64> = options.period.map(|p| p.1);
        if let Some(oldest) = plan.oldest_tstamp {
            before = Some(before.map_or(oldest, |b| b.min(oldest)));
        }
        if before.is_some() && dashboard_only {
            tracing::warn!("{}: skipping posts on a dashboard-only blog is slow", account);
        }

        let filter = options.filter.as_deref().map(parse_filter).transpose()
            .map_err(VaultError::Config)?;
        let media_log = if options.media_list {
            Some(Arc::new(MediaLog::open(&layout)?))
        } else {
            None
        };
        let media = MediaDownloader::new(
            client.clone(),
            coord.clone(),
            layout.clone(),
            &options,
            prev_archive
                .zip(plan.pa_options)
                .map(|(prev, pa)| (prev.to_path_buf(), pa)),
        );
        let notes = options.save_notes.then(|| {
            let scraper = NoteScraper::new(client.clone(), coord.clone(), options.notes_limit);
            if dashboard_only {
                scraper.disable_for(account);
            }
            scraper
        });

        let css_rel = if layout.root().join(CUSTOM_CSS_FILENAME).exists() {
            format!("{}/{}", layout.root_href(), CUSTOM_CSS_FILENAME)
        } else {
            format!("{}/{}", layout.root_href(), crate::archive::BACKUP_CSS_FILENAME)
        };
        let renderer = Arc::new(PostRenderer {
            layout: layout.clone(),
            options: options.clone(),
            blog: blog.clone(),
            post_header: page_header(&blog, &css_rel, "", "post", "", None),
            media,
            media_log,
            notes,
        });

        let pool = ThreadPool::new(coord.clone(), options.threads);
        let api = ApiThread::spawn(coord.clone(), source);

        // Posts arrive in reverse chronological order; post #0 is the most
        // recent one
        let mut remaining_idents: VecDeque<u64> =
            options.idents.clone().unwrap_or_default().into();
        let mut offset = options.skip;

        let loop_result: Result<bool> = (|| {
            let mut next_ident: Option<u64> = None;
            loop {
                if coord.interrupted() {
                    return Err(VaultError::Interrupted);
                }
                tracing::info!(
                    "{}: getting {}posts {} to {}{}",
                    account,
                    if likes { "liked " } else { "" },
                    offset,
                    offset + MAX_POSTS - 1,
                    count_estimate
                        .map(|n| format!(" (of {} expected)", n))
                        .unwrap_or_default(),
                );

                let args = if options.idents.is_some() {
                    match remaining_idents.pop_front() {
                        Some(id) => {
                            next_ident = Some(id);
                            FetchArgs::Ident(id)
                        }
                        None => {
                            tracing::info!("{}: stopping backup: end of requested posts", account);
                            return Ok(true);
                        }
                    }
                } else if let Some(bound) = before {
                    FetchArgs::Before(bound)
                } else {
                    FetchArgs::Start(offset)
                };

                api.put(FetchRequest {
                    count: MAX_POSTS,
                    args,
                });
                let Some(batch) = api.get()? else {
                    return Ok(false); // target failed, already logged
                };
                if batch.posts.is_empty() {
                    tracing::info!("{}: backup complete: found empty set of posts", account);
                    return Ok(true);
                }

                // Batches are not guaranteed pre-sorted by the source
                let mut posts = Vec::with_capacity(batch.posts.len());
                for raw in batch.posts {
                    match PostRecord::parse(raw) {
                        Ok(post) => posts.push(post),
                        Err(e) => tracing::error!("{}: {}", account, e),
                    }
                }
                posts.sort_by_key(|p| std::cmp::Reverse(p.key(likes)));

                let mut oldest_date: Option<i64> = None;
                let mut stop = false;
                for post in posts {
                    coord.block_on_faults();
                    let date = post.date(likes);
                    oldest_date = Some(date);

                    if let Some(bound) = before {
                        if date >= bound {
                            if dashboard_only {
                                continue; // cannot request 'before' with the svc API
                            }
                            return Err(VaultError::DateInvariant {
                                post_date: date,
                                before: bound,
                            });
                        }
                    }
                    if let Some(max) = ident_max {
                        if post.key(likes) <= max {
                            tracing::info!(
                                "{}: stopping backup: incremental backup complete",
                                account
                            );
                            stop = true;
                            break;
                        }
                    }
                    if let Some((start, _)) = options.period {
                        if date < start {
                            tracing::info!("{}: stopping backup: reached end of period", account);
                            stop = true;
                            break;
                        }
                    }
                    if let Some(expected) = next_ident {
                        if post.id != expected {
                            tracing::error!("{}: post '{}' not found", account, expected);
                            return Err(VaultError::PostNotFound(expected));
                        }
                    }
                    if let Some(request) = &options.request {
                        let tags = request
                            .get(&post.type_name)
                            .or_else(|| request.get(TYPE_ANY));
                        let Some(tags) = tags else { continue };
                        if !tags.contains(TAG_ANY)
                            && !post.tags.iter().any(|t| tags.contains(&t.to_lowercase()))
                        {
                            continue;
                        }
                    }
                    if options.no_reblog && post.is_reblog() {
                        continue;
                    }
                    if options.only_reblog && !post.is_reblog() {
                        continue;
                    }
                    if let Some(filter) = &filter {
                        if !filter.matches(&post.raw) {
                            filter_skipped += 1;
                            continue;
                        }
                    }
                    if options.no_post_clobber && layout.post_path(post.id).exists() {
                        continue; // post exists and no-clobber enabled
                    }

                    let renderer = renderer.clone();
                    pool.add_work(Box::new(move || renderer.save_post(&post)));

                    post_count += 1;
                    if let Some(limit) = options.count {
                        if post_count >= limit {
                            tracing::info!(
                                "{}: stopping backup: reached limit of {} posts",
                                account,
                                limit
                            );
                            stop = true;
                            break;
                        }
                    }
                }
                if stop {
                    return Ok(true);
                }

                if likes {
                    match batch.next_before {
                        Some(next) => before = Some(next),
                        None => {
                            tracing::info!("{}: backup complete: found end of likes", account);
                            return Ok(true);
                        }
                    }
                } else if let (Some(bound), false) = (before, dashboard_only) {
                    if let Some(mut oldest) = oldest_date {
                        debug_assert!(oldest <= bound);
                        if oldest == bound {
                            // Guarantee strictly decreasing pagination even
                            // on an exact timestamp tie
                            oldest -= 1;
                        }
                        before = Some(oldest);
                    }
                }

                offset += if options.idents.is_some() { 1 } else { MAX_POSTS };
            }
        })();

        match loop_result {
            Ok(clean) => {
                api.quit();
                // Wait until all posts have been saved
                let post_failures = pool.wait();
                if post_failures {
                    self.postfail_blogs.push(account.to_string());
                }
                let mut account_failed = false;
                if !clean {
                    self.failed_blogs.push(account.to_string());
                    account_failed = true;
                }

                if post_count > 0 {
                    index::finalize(
                        &layout,
                        &client,
                        &blog,
                        &options,
                        prev_archive,
                        account_failed,
                    )?;
                }

                let skipped_msg = if filter_skipped > 0 {
                    format!(", {} did not match filter", filter_skipped)
                } else {
                    String::new()
                };
                tracing::info!(
                    "{}: {} {}posts backed up{}",
                    account,
                    post_count,
                    if likes { "liked " } else { "" },
                    skipped_msg
                );
                self.total_count += post_count;
                Ok(())
            }
            Err(e) => {
                // Ensure proper thread pool termination, discarding
                // whatever was still queued
                pool.cancel();
                api.quit();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Batch, Meta};
    use serde_json::json;
    use tempfile::tempdir;

    /// Yields scripted pages and records how it was called
    struct ScriptedSource {
        batches: Vec<Vec<(u64, i64)>>,
        calls: std::sync::Arc<std::sync::Mutex<Vec<FetchArgs>>>,
        next_before: Vec<Option<i64>>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<Vec<(u64, i64)>>) -> Self {
            Self {
                batches,
                calls: Default::default(),
                next_before: Vec::new(),
            }
        }
    }

    fn raw_post(id: u64, timestamp: i64) -> serde_json::Value {
        json!({
            "id": id,
            "timestamp": timestamp,
            "type": "text",
            "tags": [],
            "blog_name": "example",
            "title": format!("post {}", id),
            "body": "<p>body</p>",
        })
    }

    impl PostSource for ScriptedSource {
        fn get_initial(&mut self) -> crate::Result<Option<Meta>> {
            Ok(Some(Meta {
                title: Some("Example".to_string()),
                description: None,
                count_estimate: Some(self.batches.iter().map(Vec::len).sum::<usize>() as u64),
                share_likes: None,
            }))
        }

        fn fetch(&mut self, _count: usize, args: FetchArgs) -> crate::Result<Option<Batch>> {
            let mut calls = self.calls.lock().unwrap();
            let page = calls.len();
            calls.push(args);
            let posts = self
                .batches
                .get(page)
                .map(|ids| ids.iter().map(|&(id, ts)| raw_post(id, ts)).collect())
                .unwrap_or_default();
            Ok(Some(Batch {
                posts,
                next_before: self.next_before.get(page).copied().flatten(),
            }))
        }
    }

    fn test_options() -> Options {
        let mut options = Options::default();
        options.threads = 1;
        options.media_list = true; // records save order in media.json
        options
    }

    fn run_driver(
        root: &Path,
        options: Options,
        source: ScriptedSource,
    ) -> (BackupDriver, Vec<FetchArgs>) {
        let calls = source.calls.clone();
        let mut options = options;
        options.no_get = true;
        options.reuse_json = true; // keeps every path offline
        let layout = Layout::new(root.to_path_buf(), &options);
        let mut driver =
            BackupDriver::new(options.clone(), String::new(), root.to_path_buf());
        let orig = options.clone();
        let plan = reconcile::plan("example", &layout, &mut options, &orig, None).unwrap();
        let client = build_client(None).unwrap();
        let coord = Coord::for_archive(root.to_path_buf());
        driver
            .run_target(
                "example",
                None,
                options,
                plan,
                layout,
                client,
                coord,
                Box::new(source),
            )
            .unwrap();
        let calls = calls.lock().unwrap().clone();
        (driver, calls)
    }

    fn saved_order(root: &Path) -> Vec<u64> {
        std::fs::read_to_string(root.join("media.json"))
            .unwrap_or_default()
            .lines()
            .map(|line| {
                serde_json::from_str::<serde_json::Value>(line).unwrap()["post"]
                    .as_u64()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_fresh_run_saves_all_posts_in_order_and_stops_on_empty_page() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new(vec![
            vec![(9, 900), (8, 800)],
            vec![(7, 700), (6, 600)],
            vec![],
        ]);
        let (driver, calls) = run_driver(dir.path(), test_options(), source);

        assert_eq!(saved_order(dir.path()), vec![9, 8, 7, 6]);
        assert_eq!(driver.total_count, 4);
        assert_eq!(calls.len(), 3, "stopped right after the empty page");
        for ident in [9u64, 8, 7, 6] {
            assert!(dir.path().join(format!("posts/{}.html", ident)).exists());
        }
        assert!(dir.path().join(".complete").exists());
        assert_eq!(driver.exit_code(), EXIT_SUCCESS);
    }

    #[test]
    fn test_unsorted_batch_is_processed_descending() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new(vec![vec![(6, 600), (9, 900), (7, 700)], vec![]]);
        let (_, _) = run_driver(dir.path(), test_options(), source);
        assert_eq!(saved_order(dir.path()), vec![9, 7, 6]);
    }

    #[test]
    fn test_count_limit_stops_early() {
        let dir = tempdir().unwrap();
        let mut options = test_options();
        options.count = Some(3);
        let source = ScriptedSource::new(vec![
            vec![(9, 900), (8, 800)],
            vec![(7, 700), (6, 600)],
            vec![(5, 500)],
        ]);
        let (driver, calls) = run_driver(dir.path(), options, source);
        assert_eq!(saved_order(dir.path()), vec![9, 8, 7]);
        assert_eq!(driver.total_count, 3);
        assert_eq!(calls.len(), 2, "no further page fetched after the limit");
    }

    #[test]
    fn test_period_bounds_posts_and_stops() {
        let dir = tempdir().unwrap();
        let mut options = test_options();
        options.period = Some((700, 900)); // [start, end)
        let source = ScriptedSource::new(vec![
            vec![(8, 850), (7, 750)],
            vec![(6, 650), (5, 550)],
            vec![],
        ]);
        let (_, calls) = run_driver(dir.path(), options, source);
        let saved = saved_order(dir.path());
        assert_eq!(saved, vec![8, 7]);
        assert_eq!(calls.len(), 2, "stopped once the period start was passed");
        assert!(matches!(calls[0], FetchArgs::Before(900)));
    }

    #[test]
    fn test_before_tightens_to_oldest_seen() {
        let dir = tempdir().unwrap();
        let mut options = test_options();
        options.period = Some((0, 1000));
        let source = ScriptedSource::new(vec![
            vec![(9, 900), (8, 900)], // shared timestamps tighten once
            vec![(7, 700)],
            vec![],
        ]);
        let (_, calls) = run_driver(dir.path(), options, source);
        assert!(matches!(calls[0], FetchArgs::Before(1000)));
        assert!(matches!(calls[1], FetchArgs::Before(900)));
        assert!(matches!(calls[2], FetchArgs::Before(700)));
        assert_eq!(saved_order(dir.path()), vec![9, 8, 7]);
    }

    #[test]
    fn test_incremental_stops_at_existing_boundary() {
        let dir = tempdir().unwrap();

        // First run: populate the archive
        let source = ScriptedSource::new(vec![vec![(7, 700), (6, 600)], vec![]]);
        let (_, _) = run_driver(dir.path(), test_options(), source);
        assert_eq!(saved_order(dir.path()), vec![7, 6]);

        // Incremental run: only ids above 7 get saved
        let mut options = test_options();
        options.incremental = true;
        options.no_post_clobber = true;
        let source = ScriptedSource::new(vec![vec![(9, 900), (8, 800), (7, 700)], vec![]]);
        let (driver, calls) = run_driver(dir.path(), options, source);

        assert_eq!(saved_order(dir.path()), vec![7, 6, 9, 8]);
        assert_eq!(driver.total_count, 2, "only the new posts count");
        assert_eq!(calls.len(), 1, "stopped at the boundary post");
    }

    #[test]
    fn test_date_invariant_violation_is_fatal() {
        let dir = tempdir().unwrap();
        let mut options = test_options();
        options.no_get = true;
        options.reuse_json = true;
        options.period = Some((0, 500));
        let layout = Layout::new(dir.path().to_path_buf(), &options);
        let mut driver =
            BackupDriver::new(options.clone(), String::new(), dir.path().to_path_buf());
        let orig = options.clone();
        let plan = reconcile::plan("example", &layout, &mut options, &orig, None).unwrap();
        let client = build_client(None).unwrap();
        let coord = Coord::for_archive(dir.path().to_path_buf());

        // A post newer than the before bound violates the invariant
        let source = ScriptedSource::new(vec![vec![(9, 900)]]);
        let err = driver
            .run_target(
                "example",
                None,
                options,
                plan,
                layout,
                client,
                coord,
                Box::new(source),
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::DateInvariant { .. }));
        assert!(
            !dir.path().join(".complete").exists(),
            "failed target gets no completion marker"
        );
    }

    #[test]
    fn test_type_filter_skips_posts() {
        let dir = tempdir().unwrap();
        let mut options = test_options();
        options.request = Some(
            crate::config::parse_request(&["photo".to_string()]).unwrap(),
        );
        let source = ScriptedSource::new(vec![vec![(9, 900), (8, 800)], vec![]]);
        let (driver, _) = run_driver(dir.path(), options, source);
        assert_eq!(driver.total_count, 0, "text posts all filtered out");
        assert_eq!(driver.exit_code(), EXIT_NOPOSTS);
    }

    #[test]
    fn test_filter_expression_counts_skips() {
        let dir = tempdir().unwrap();
        let mut options = test_options();
        options.filter = Some("/id=8".to_string());
        let source = ScriptedSource::new(vec![vec![(9, 900), (8, 800)], vec![]]);
        let (driver, _) = run_driver(dir.path(), options, source);
        assert_eq!(saved_order(dir.path()), vec![8]);
        assert_eq!(driver.total_count, 1);
    }

    #[test]
    fn test_no_post_clobber_skips_existing_files() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new(vec![vec![(9, 900)], vec![]]);
        let (_, _) = run_driver(dir.path(), test_options(), source);
        let first = std::fs::metadata(dir.path().join("posts/9.html")).unwrap();

        let mut options = test_options();
        options.no_post_clobber = true;
        let source = ScriptedSource::new(vec![vec![(9, 900)], vec![]]);
        let (driver, _) = run_driver(dir.path(), options, source);
        let second = std::fs::metadata(dir.path().join("posts/9.html")).unwrap();
        assert_eq!(
            first.modified().unwrap(),
            second.modified().unwrap(),
            "existing file untouched"
        );
        assert_eq!(driver.total_count, 0);
    }

    #[test]
    fn test_likes_paging_follows_next_link() {
        let dir = tempdir().unwrap();
        let mut options = test_options();
        options.likes = true;

        let mut source = ScriptedSource::new(vec![vec![], vec![]]);
        source.batches = vec![
            vec![(2, 0)], // liked_timestamp injected below
            vec![(1, 0)],
        ];
        // Build posts with liked timestamps through raw fetch override:
        // simpler to express via next_before scripting only
        source.next_before = vec![Some(500), None];

        // Raw posts need liked_timestamp for likes mode; patch batches
        struct LikesSource(ScriptedSource);
        impl PostSource for LikesSource {
            fn get_initial(&mut self) -> crate::Result<Option<Meta>> {
                self.0.get_initial()
            }
            fn fetch(&mut self, count: usize, args: FetchArgs) -> crate::Result<Option<Batch>> {
                let batch = self.0.fetch(count, args)?.map(|mut batch| {
                    for post in &mut batch.posts {
                        let id = post["id"].as_u64().unwrap();
                        post["liked_timestamp"] = serde_json::json!(id * 100);
                    }
                    batch
                });
                Ok(batch)
            }
        }

        let calls = source.calls.clone();
        let mut options_eff = options.clone();
        options_eff.no_get = true;
        options_eff.reuse_json = true;
        let layout = Layout::new(dir.path().to_path_buf(), &options_eff);
        let mut driver =
            BackupDriver::new(options_eff.clone(), String::new(), dir.path().to_path_buf());
        let orig = options_eff.clone();
        let plan =
            reconcile::plan("example", &layout, &mut options_eff, &orig, None).unwrap();
        let client = build_client(None).unwrap();
        let coord = Coord::for_archive(dir.path().to_path_buf());
        driver
            .run_target(
                "example",
                None,
                options_eff,
                plan,
                layout,
                client,
                coord,
                Box::new(LikesSource(source)),
            )
            .unwrap();

        let calls = calls.lock().unwrap();
        assert!(matches!(calls[0], FetchArgs::Start(0)));
        assert!(
            matches!(calls[1], FetchArgs::Before(500)),
            "second page follows the next link"
        );
        assert_eq!(calls.len(), 2, "missing next link ends the run");
        assert_eq!(driver.total_count, 2);
    }
}

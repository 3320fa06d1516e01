//! Pre-flight reconciliation against existing archive state
//!
//! Runs once per target, before any fetching: loads the option snapshots
//! of this archive and of a previous archive being reused as a media
//! source, enforces option compatibility, computes the resume cursor, and
//! decides whether a first-run options snapshot should be written.

use std::path::Path;

use serde_json::Value;

use crate::archive::media::MediaPathOptions;
use crate::archive::{state, Layout};
use crate::config::{Options, BACKUP_CHANGING_OPTIONS, MUST_MATCH_OPTIONS, PREV_MUST_MATCH_OPTIONS};
use crate::{Result, VaultError};

/// What reconciliation produced
#[derive(Debug)]
pub struct Plan {
    /// Resume bound: only posts strictly older than this get backed up
    pub oldest_tstamp: Option<i64>,
    /// Media-path options to use when probing the previous archive
    pub pa_options: Option<MediaPathOptions>,
    /// A brand-new archive: record the first-run options snapshot once the
    /// output directory exists
    pub write_first_run_options: bool,
}

/// A recorded option snapshot, with diff helpers
struct Snapshot<'a> {
    recorded: &'a serde_json::Map<String, Value>,
    current: serde_json::Map<String, Value>,
}

impl<'a> Snapshot<'a> {
    fn new(recorded: &'a serde_json::Map<String, Value>, options: &Options) -> Self {
        Self {
            recorded,
            current: options.to_snapshot(),
        }
    }

    fn differs(&self, key: &str) -> bool {
        match self.recorded.get(key) {
            Some(value) => self.current.get(key) != Some(value),
            None => true,
        }
    }

    fn diff_keys(&self, keys: &[&str]) -> Vec<String> {
        keys.iter()
            .filter(|key| self.differs(key))
            .map(|key| key.to_string())
            .collect()
    }

    fn describe(map: &serde_json::Map<String, Value>, keys: &[String]) -> String {
        let shown: serde_json::Map<String, Value> = keys
            .iter()
            .map(|key| {
                (
                    key.clone(),
                    map.get(key).cloned().unwrap_or(Value::String("<not present>".to_string())),
                )
            })
            .collect();
        serde_json::to_string(&shown).unwrap_or_default()
    }

    fn this(&self, keys: &[String]) -> String {
        Self::describe(&self.current, keys)
    }

    fn first(&self, keys: &[String]) -> String {
        Self::describe(self.recorded, keys)
    }
}

/// Validates this run's options against the archive on disk and computes
/// the resume cursor
///
/// `options` is the effective option set for this target and may be
/// adjusted (recorded first-run values are adopted when resuming without
/// overrides); `orig_options` is the set the user actually gave.
pub fn plan(
    account: &str,
    layout: &Layout,
    options: &mut Options,
    orig_options: &Options,
    prev_archive: Option<&Path>,
) -> Result<Plan> {
    let complete_backup = state::is_complete(layout);
    let first_run_options = state::read_first_run_options(layout.root())?;

    // These options must always match
    let mut backdiff_nondef: Option<Vec<String>> = None;
    if let Some(fro) = &first_run_options {
        let snapshot = Snapshot::new(fro, orig_options);

        let mustmatchdiff = snapshot.diff_keys(MUST_MATCH_OPTIONS);
        if !mustmatchdiff.is_empty() {
            return Err(VaultError::IncompatibleArchive(format!(
                "{}: the script was given {} but the existing backup was made with {}",
                account,
                snapshot.this(&mustmatchdiff),
                snapshot.first(&mustmatchdiff)
            )));
        }

        let backdiff = snapshot.diff_keys(BACKUP_CHANGING_OPTIONS);
        if complete_backup {
            // Complete archives may be added to with different options
            let orig_period_start = orig_options.period.map_or(0, |p| p.0);
            let first_period_start = fro
                .get("period")
                .and_then(|p| p.get(0))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let first_count_unset = fro.get("count").is_none_or(Value::is_null);
            if options.resume && first_count_unset && orig_period_start >= first_period_start {
                return Err(VaultError::IncompatibleArchive(format!(
                    "{}: cannot continue complete backup that was not stopped early with --count or --period",
                    account
                )));
            }
        } else if options.resume {
            let defaults = Options::default().to_snapshot();
            let nondef: Vec<String> = backdiff
                .iter()
                .filter(|key| snapshot.current.get(*key) != defaults.get(*key))
                .cloned()
                .collect();
            if !nondef.is_empty() && !options.ignore_diffopt {
                return Err(VaultError::IncompatibleArchive(format!(
                    "{}: the script was given {} but the existing backup was made with {}. \
                     You may skip this check with --ignore-diffopt.",
                    account,
                    snapshot.this(&nondef),
                    snapshot.first(&nondef)
                )));
            }
            backdiff_nondef = Some(nondef);
        } else if backdiff.is_empty() {
            return Err(VaultError::IncompatibleArchive(format!(
                "{}: found incomplete archive, try --continue",
                account
            )));
        } else if !options.ignore_diffopt {
            return Err(VaultError::IncompatibleArchive(format!(
                "{}: refusing to make a different backup (with {} instead of {}) over an \
                 incomplete archive. Delete the old backup to start fresh, or skip this check \
                 with --ignore-diffopt (optionally with --continue).",
                account,
                snapshot.this(&backdiff),
                snapshot.first(&backdiff)
            )));
        }
    }

    // The previous archive's own snapshot, for media-path probing
    let mut pa_options = None;
    if let Some(prev) = prev_archive {
        let pa_snapshot = state::read_first_run_options(prev)?;
        let fallback = MediaPathOptions::from_options(options);
        match &pa_snapshot {
            Some(snap) => {
                let snapshot = Snapshot::new(snap, orig_options);
                let mustmatchdiff = snapshot.diff_keys(PREV_MUST_MATCH_OPTIONS);
                if !mustmatchdiff.is_empty() {
                    return Err(VaultError::IncompatibleArchive(format!(
                        "{}: the script was given {} but the previous archive was made with {}",
                        account,
                        snapshot.this(&mustmatchdiff),
                        snapshot.first(&mustmatchdiff)
                    )));
                }
                pa_options = Some(MediaPathOptions::from_snapshot(snap, &fallback));
            }
            None => {
                tracing::warn!(
                    "{}: unknown media path options for previous archive, assuming they match ours",
                    account
                );
                pa_options = Some(fallback);
            }
        }
    }

    // The resume cursor: the oldest timestamp already saved
    let mut oldest_tstamp = None;
    let mut have_posts = false;
    if options.resume || !complete_backup {
        let post_files = layout.find_post_files();
        have_posts = !post_files.is_empty();
        if options.resume {
            if post_files.is_empty() {
                return Err(VaultError::EmptyArchive);
            }
            tracing::warn!("{}: found incomplete backup", account);
            if options.likes {
                tracing::warn!("{}: finding oldest liked post (may take a while)", account);
            }
            let oldest = state::oldest_saved_timestamp(layout, &post_files, options.likes)?;
            if let Some(ts) = oldest {
                tracing::info!("{}: backing up posts before timestamp={}", account, ts);
            }
            oldest_tstamp = oldest;
        }
    }

    let mut write_first_run_options = false;
    if let (Some(nondef), Some(fro)) = (&backdiff_nondef, &first_run_options) {
        // Adopt the recorded options, except those overridden via
        // --ignore-diffopt
        for key in BACKUP_CHANGING_OPTIONS {
            if !nondef.iter().any(|k| k.as_str() == *key) {
                if let Some(value) = fro.get(*key) {
                    options.set(key, value.clone());
                }
            }
        }
    } else if first_run_options.is_none() && !complete_backup && !have_posts {
        // Presumably this is the initial backup of this blog
        write_first_run_options = true;
    }

    Ok(Plan {
        oldest_tstamp,
        pa_options,
        write_first_run_options,
    })
}

/// The incremental bound: the newest key already saved, below which the
/// paging loop stops
pub fn incremental_bound(layout: &Layout, options: &Options, account: &str) -> Result<Option<i64>> {
    let post_files = layout.find_post_files();
    if post_files.is_empty() {
        return Ok(None);
    }
    if options.likes {
        tracing::warn!("{}: finding newest liked post (may take a while)", account);
    }
    let bound = state::newest_saved_key(layout, &post_files, options.likes)?;
    match (bound, options.likes) {
        (Some(ts), true) => {
            tracing::info!("{}: backing up posts after timestamp={}", account, ts)
        }
        (Some(id), false) => tracing::info!("{}: backing up posts after id={}", account, id),
        _ => {}
    }
    Ok(bound)
}

//! Paginated response sources
//!
//! "Where posts come from" is one interface with two implementations: the
//! live content API, and a replay over the `json/` documents a previous run
//! saved. Both yield batches of raw post records in the same shape, so the
//! backup driver does not care which one it pages through.

mod live;
mod replay;

pub use live::{build_client, LiveSource};
pub use replay::ReplaySource;

use serde_json::Value;

use crate::Result;

/// Maximum number of posts one fetch may request
pub const MAX_POSTS: usize = 50;

/// How to address a page. Exactly one addressing mode is used per fetch,
/// and a source must be paged with a single mode for its whole life (except
/// that the first page may be `Start(0)` before `Before` paging begins).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchArgs {
    /// Numeric offset from the newest post
    Start(usize),
    /// Only posts with a key strictly below this bound
    Before(i64),
    /// Exactly one post, by id
    Ident(u64),
}

/// One fetched page
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Raw post records; not guaranteed sorted
    pub posts: Vec<Value>,
    /// The `before` cursor of the next page, when the API provides one
    /// (likes mode only)
    pub next_before: Option<i64>,
}

/// Blog metadata from the initial probe
#[derive(Debug, Clone, Default)]
pub struct Meta {
    pub title: Option<String>,
    pub description: Option<String>,
    /// Total post count the source expects to deliver, if known
    pub count_estimate: Option<u64>,
    /// Whether the blog shares its likes (likes mode only)
    pub share_likes: Option<bool>,
}

/// A paginated supply of raw post records
pub trait PostSource: Send {
    /// Probes the source once, before paging starts
    ///
    /// `None` means the target is unusable (logged by the source); the
    /// caller marks the target failed.
    fn get_initial(&mut self) -> Result<Option<Meta>>;

    /// Fetches one page of at most `count` posts
    ///
    /// `Ok(None)` means the fetch failed in a way that fails the target;
    /// fatal conditions (rate-limit exhaustion) are errors.
    fn fetch(&mut self, count: usize, args: FetchArgs) -> Result<Option<Batch>>;

    /// Whether this source is the dashboard-restricted live variant, which
    /// cannot filter by `before` server-side
    fn dashboard_only(&self) -> bool {
        false
    }
}

/// One queued fetch call, handed to the API helper thread
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest {
    pub count: usize,
    pub args: FetchArgs,
}

/// What the API helper thread hands back
pub type FetchOutcome = Result<Option<Batch>>;

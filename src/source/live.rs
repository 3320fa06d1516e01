//! Live API source
//!
//! Issues paginated requests against the content API. Handles the
//! dashboard-only fallback (blogs hidden from the public API), likes mode,
//! rate-limit headers, and connectivity loss.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeDelta};
use serde_json::Value;

use crate::backup::coord::{Coord, FaultKind};
use crate::source::{Batch, FetchArgs, Meta, PostSource};
use crate::{Result, VaultError};

/// Attempts per request: the original call plus one post-rate-limit retry
const TRY_LIMIT: u32 = 2;

const DEFAULT_USER_AGENT: &str = concat!("tumblr-vault/", env!("CARGO_PKG_VERSION"));

/// Builds the blocking HTTP client all API and media requests go through
pub fn build_client(user_agent: Option<&str>) -> reqwest::Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent(user_agent.unwrap_or(DEFAULT_USER_AGENT))
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// The live paginated API source
pub struct LiveSource {
    client: reqwest::blocking::Client,
    coord: Arc<Coord>,
    account: String,
    blog_name: String,
    api_key: String,
    likes: bool,
    api_base: String,
    svc_base: String,
    /// `None` until the first response settles the question
    dashboard_only: Option<bool>,
}

impl LiveSource {
    pub fn new(
        client: reqwest::blocking::Client,
        coord: Arc<Coord>,
        account: &str,
        api_key: String,
        likes: bool,
    ) -> Result<Self> {
        if account.contains(['/', '\\']) || matches!(account, "." | "..") {
            return Err(VaultError::Config(crate::ConfigError::Validation(format!(
                "invalid blog name: '{}'",
                account
            ))));
        }
        let blog_name = if account.contains('.') {
            account.to_string()
        } else {
            format!("{}.tumblr.com", account)
        };
        Ok(Self {
            client,
            coord,
            account: account.to_string(),
            blog_name,
            api_key,
            likes,
            api_base: "https://api.tumblr.com".to_string(),
            svc_base: "https://www.tumblr.com".to_string(),
            dashboard_only: None,
        })
    }

    /// Points the source at different hosts; used by tests
    pub fn with_bases(mut self, api_base: &str, svc_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.svc_base = svc_base.trim_end_matches('/').to_string();
        self
    }

    fn posts_key(&self) -> &'static str {
        if self.likes {
            "liked_posts"
        } else {
            "posts"
        }
    }

    /// One API call; `Ok(None)` fails the target
    fn apiparse(&mut self, count: usize, args: FetchArgs) -> Result<Option<Value>> {
        loop {
            let (url, params, headers) = self.build_request(count, args);

            let (doc, status, reason) = match self.get_resp(&url, &params, &headers) {
                Ok(resp) => resp,
                Err(VaultError::Reqwest(e)) => {
                    tracing::error!("URL is {}: error retrieving API response: {}", url, e);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            if !(200..300).contains(&status) {
                // Detect dashboard-only blogs by the error code
                if status == 404 && self.dashboard_only.is_none() && !self.likes {
                    let code = doc
                        .as_ref()
                        .and_then(|d| d.pointer("/errors/0/code"))
                        .and_then(Value::as_i64);
                    if code == Some(4012) {
                        self.dashboard_only = Some(true);
                        tracing::info!("{}: found dashboard-only blog, trying svc API", self.account);
                        continue; // one retry against the other endpoint
                    }
                }
                if status == 403 && self.likes {
                    tracing::error!("HTTP 403: most likely {} does not have public likes", self.account);
                    return Ok(None);
                }
                tracing::error!(
                    "URL is {}: non-OK API response: HTTP {} {}",
                    url,
                    status,
                    reason
                );
                return Ok(None);
            }

            let Some(doc) = doc else {
                return Ok(None); // OK status but invalid JSON
            };

            if self.dashboard_only.is_none() {
                // The first successful plain API request settles it
                self.dashboard_only = Some(false);
            }

            return Ok(doc.get("response").cloned().or(Some(doc)));
        }
    }

    fn build_request(
        &self,
        count: usize,
        args: FetchArgs,
    ) -> (String, Vec<(String, String)>, Vec<(&'static str, String)>) {
        if self.dashboard_only == Some(true) {
            let url = format!("{}/svc/indash_blog", self.svc_base);
            let mut params = vec![
                ("tumblelog_name_or_id".to_string(), self.account.clone()),
                ("post_id".to_string(), String::new()),
                ("limit".to_string(), count.to_string()),
                ("should_bypass_safemode".to_string(), "true".to_string()),
                ("should_bypass_tagfiltering".to_string(), "true".to_string()),
            ];
            match args {
                FetchArgs::Ident(id) => params[1].1 = id.to_string(),
                FetchArgs::Start(s) if s > 0 => {
                    params.push(("offset".to_string(), s.to_string()));
                }
                // 'before' is unsupported by the svc API
                _ => {}
            }
            let headers = vec![
                (
                    "Referer",
                    format!("{}/dashboard/blog/{}", self.svc_base, self.account),
                ),
                ("X-Requested-With", "XMLHttpRequest".to_string()),
            ];
            (url, params, headers)
        } else {
            let url = format!(
                "{}/v2/blog/{}/{}",
                self.api_base,
                self.blog_name,
                if self.likes { "likes" } else { "posts" }
            );
            let mut params = vec![
                ("api_key".to_string(), self.api_key.clone()),
                ("limit".to_string(), count.to_string()),
                ("reblog_info".to_string(), "true".to_string()),
            ];
            match args {
                FetchArgs::Ident(id) => params.push(("id".to_string(), id.to_string())),
                FetchArgs::Before(b) => params.push(("before".to_string(), b.to_string())),
                FetchArgs::Start(s) if s > 0 => {
                    params.push(("offset".to_string(), s.to_string()));
                }
                FetchArgs::Start(_) => {}
            }
            (url, params, Vec::new())
        }
    }

    /// Sends one request, retrying through connectivity loss and hourly
    /// rate limits
    fn get_resp(
        &self,
        url: &str,
        params: &[(String, String)],
        headers: &[(&'static str, String)],
    ) -> Result<(Option<Value>, u16, String)> {
        let mut try_count = 0;
        loop {
            let mut req = self.client.get(url).query(params);
            for (name, value) in headers {
                req = req.header(*name, value.as_str());
            }

            let resp = match req.send() {
                Ok(resp) => resp,
                Err(e) => {
                    if (e.is_connect() || e.is_timeout())
                        && !self.coord.is_destroyed()
                        && !self.coord.probe_healthy(FaultKind::NoInternet)
                    {
                        self.coord.raise(FaultKind::NoInternet);
                        continue;
                    }
                    return Err(e.into());
                }
            };
            try_count += 1;

            let http_status = resp.status();
            let reason = http_status
                .canonical_reason()
                .unwrap_or("(unknown)")
                .to_string();
            let rl_headers = RateLimitHeaders::from(resp.headers());

            let doc: Option<Value> = if http_status.is_success() || http_status.is_client_error() {
                match resp.json() {
                    Ok(doc) => Some(doc),
                    Err(e) => {
                        tracing::error!("invalid JSON from {}: {}", url, e);
                        None
                    }
                }
            } else {
                None // server error, will not attempt to read the body
            };

            // The envelope's meta.status wins over the transport status
            let status = doc
                .as_ref()
                .and_then(|d| d.pointer("/meta/status"))
                .and_then(Value::as_u64)
                .map_or(http_status.as_u16(), |s| s as u16);

            if status == 429 && try_count < TRY_LIMIT && self.ratelimit_sleep(&rl_headers)? {
                continue;
            }
            return Ok((doc, status, reason));
        }
    }

    /// Handles 429 headers; `Ok(true)` means "slept, retry the request"
    fn ratelimit_sleep(&self, headers: &RateLimitHeaders) -> Result<bool> {
        // Daily rate limit
        if headers.perday_remaining.as_deref() == Some("0") {
            let msg = match headers.perday_reset.as_deref().and_then(|r| r.parse::<f64>().ok()) {
                Some(reset) => {
                    let when = Local::now()
                        + TimeDelta::seconds(reset as i64);
                    format!("at {}", when.format("%c"))
                }
                None => {
                    tracing::error!(
                        "expected numerical X-Ratelimit-Perday-Reset, got {:?}",
                        headers.perday_reset
                    );
                    "sometime tomorrow".to_string()
                }
            };
            return Err(VaultError::RateLimit(format!(
                "{}: daily API rate limit exceeded. Resume with --continue after reset {}.",
                self.account, msg
            )));
        }

        // Hourly rate limit
        let Some(reset) = headers.perhour_reset.as_deref() else {
            return Ok(false);
        };
        let Ok(sleep_dur) = reset.parse::<f64>() else {
            tracing::error!(
                "{}: expected numerical X-Ratelimit-Perhour-Reset, got '{}'",
                self.account,
                reset
            );
            return Ok(false);
        };

        if sleep_dur < 0.0 {
            tracing::warn!(
                "{}: X-Ratelimit-Perhour-Reset is {}s in the past",
                self.account,
                -sleep_dur
            );
            return Ok(true);
        }
        if sleep_dur > 3600.0 {
            let when = Local::now() + TimeDelta::seconds(sleep_dur as i64);
            return Err(VaultError::RateLimit(format!(
                "{}: refusing to sleep for {:.0}s. Resume with --continue at {}.",
                self.account,
                sleep_dur,
                when.format("%c")
            )));
        }

        tracing::warn!(
            "{}: hit hourly rate limit, sleeping for {:.0}s as requested",
            self.account,
            sleep_dur
        );
        // +1 to be sure we're past the reset
        std::thread::sleep(Duration::from_secs_f64(sleep_dur + 1.0));
        Ok(true)
    }
}

impl PostSource for LiveSource {
    fn get_initial(&mut self) -> Result<Option<Meta>> {
        let Some(mut resp) = self.apiparse(1, FetchArgs::Start(0))? else {
            return Ok(None);
        };

        // The svc API doesn't return blog info; steal it from the first post
        if self.dashboard_only == Some(true) {
            if let Some(blog) = resp.pointer("/posts/0/blog").cloned() {
                resp["blog"] = blog;
            }
        }

        let blog = resp.get("blog").cloned().unwrap_or_default();
        let meta = if self.likes {
            Meta {
                title: None,
                description: None,
                count_estimate: resp.get("liked_count").and_then(Value::as_u64),
                share_likes: blog.get("share_likes").and_then(Value::as_bool),
            }
        } else {
            Meta {
                title: blog.get("title").and_then(Value::as_str).map(str::to_string),
                description: blog
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                count_estimate: blog.get("posts").and_then(Value::as_u64),
                share_likes: None,
            }
        };
        Ok(Some(meta))
    }

    fn fetch(&mut self, count: usize, args: FetchArgs) -> Result<Option<Batch>> {
        let Some(resp) = self.apiparse(count, args)? else {
            return Ok(None);
        };

        let posts = resp
            .get(self.posts_key())
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let next_before = resp
            .pointer("/_links/next/query_params/before")
            .and_then(|v| match v {
                Value::String(s) => s.parse().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            });

        Ok(Some(Batch { posts, next_before }))
    }

    fn dashboard_only(&self) -> bool {
        self.dashboard_only == Some(true)
    }
}

/// The rate-limit response headers we act on
#[derive(Debug, Default)]
struct RateLimitHeaders {
    perday_remaining: Option<String>,
    perday_reset: Option<String>,
    perhour_reset: Option<String>,
}

impl RateLimitHeaders {
    fn from(headers: &reqwest::header::HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            perday_remaining: get("X-Ratelimit-Perday-Remaining"),
            perday_reset: get("X-Ratelimit-Perday-Reset"),
            perhour_reset: get("X-Ratelimit-Perhour-Reset"),
        }
    }
}

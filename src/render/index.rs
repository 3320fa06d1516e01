//! Finalization: indices, theme capture, and the completion marker
//!
//! Runs after a pass saved its posts. Everything here is derived from the
//! on-disk post files, so it can always be rebuilt; the completion marker
//! is the only state with durability requirements.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike};
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};

use crate::archive::{
    state, write_atomic, write_marker_durable, Layout, ARCHIVE_DIR, AVATAR_BASE,
    BACKUP_CSS_FILENAME, CUSTOM_CSS_FILENAME, DIR_INDEX_FILENAME, TAG_INDEX_DIR, THEME_DIR,
};
use crate::config::Options;
use crate::render::{page_header, xml_escape, Blog};
use crate::Result;

const BACKUP_CSS: &str = "\
@import url(\"override.css\");

body { width: 720px; margin: 0 auto; }
body > footer { padding: 1em 0; }
header > img { float: right; }
img { max-width: 720px; }
blockquote { margin-left: 0; border-left: 8px #999 solid; padding: 0 24px; }
.archive h1, .subtitle, article { padding-bottom: 0.75em; border-bottom: 1px #ccc dotted; }
article[class^=\"liked-\"] { background-color: #f0f0f8; }
.post a.llink { display: none; }
header a, footer a { text-decoration: none; }
footer, article footer a { font-size: small; color: #999; }
";

/// One already-saved post, re-read from disk for index building
struct LocalPost {
    ident: u64,
    date: i64,
    tags: Vec<String>,
    path: PathBuf,
}

impl LocalPost {
    fn load(layout: &Layout, path: PathBuf, want_tags: bool) -> Option<Self> {
        let ident = layout.post_id_of(&path)?;
        let date = state::post_timestamp_from_file(&path).ok()?;
        let tags = if want_tags {
            read_tags(&path).unwrap_or_default()
        } else {
            Vec::new()
        };
        Some(Self {
            ident,
            date,
            tags,
            path,
        })
    }

    /// The `<article>` block of the saved file, for inlining into archive
    /// pages
    fn article_html(&self) -> Option<String> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let start = content.find("<article")?;
        let end = content.rfind("</article>")? + "</article>".len();
        Some(content[start..end].to_string())
    }
}

/// Extracts the URL-encoded tags out of a saved post's footer
fn read_tags(path: &Path) -> Option<Vec<String>> {
    let content = std::fs::read_to_string(path).ok()?;
    let footer = &content[content.find("<footer>")?..];
    let doc = Html::parse_fragment(footer);
    let selector = Selector::parse("a").ok()?;
    let mut tags = Vec::new();
    for a in doc.select(&selector) {
        if a.value().attr("href").is_some_and(|h| h.contains("/tagged/")) {
            let name = a.text().collect::<String>();
            if let Some(tag) = name.strip_prefix('#') {
                tags.push(tag.to_string());
            }
        }
    }
    Some(tags)
}

/// Posts grouped by year and month
#[derive(Default)]
struct Index {
    months: BTreeMap<(i32, u32), Vec<LocalPost>>,
}

impl Index {
    fn add_post(&mut self, post: LocalPost) {
        let Some(dt) = DateTime::from_timestamp(post.date, 0) else {
            return;
        };
        self.months
            .entry((dt.year(), dt.month()))
            .or_default()
            .push(post);
    }

    fn is_empty(&self) -> bool {
        self.months.is_empty()
    }
}

/// Builds all derived pages and, when the pass was clean, the completion
/// marker
pub fn finalize(
    layout: &Layout,
    client: &reqwest::blocking::Client,
    blog: &Blog,
    options: &Options,
    prev_archive: Option<&Path>,
    account_failed: bool,
) -> Result<()> {
    tracing::debug!("{}: getting avatar and style", blog.account);
    get_avatar(layout, client, blog, prev_archive, options.no_get);
    get_style(layout, client, blog, prev_archive, options.no_get);
    if !layout.root().join(CUSTOM_CSS_FILENAME).exists() {
        write_atomic(&layout.root().join(BACKUP_CSS_FILENAME), BACKUP_CSS.as_bytes())?;
    }

    tracing::debug!("{}: building index", blog.account);
    let mut main_index = Index::default();
    let mut tag_indices: BTreeMap<String, Index> = BTreeMap::new();
    for path in layout.find_post_files() {
        let Some(post) = LocalPost::load(layout, path, options.tag_index) else {
            continue;
        };
        if options.tag_index {
            for tag in &post.tags {
                // Re-load per tag index; LocalPost is cheap and not Clone
                if let Some(copy) = LocalPost::load(layout, post.path.clone(), false) {
                    tag_indices.entry(tag.clone()).or_default().add_post(copy);
                }
            }
        }
        main_index.add_post(post);
    }

    save_main_index(layout, blog, options, &main_index)?;
    if options.tag_index {
        save_tag_index(layout, blog, &tag_indices)?;
    }

    if !account_failed && !state::is_complete(layout) {
        write_marker_durable(layout.root(), crate::archive::COMPLETE_MARKER)?;
    }
    Ok(())
}

fn avatar_href(layout: &Layout) -> Option<String> {
    let entries = std::fs::read_dir(layout.theme_dir()).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(AVATAR_BASE) {
            return Some(format!("{}/{}", THEME_DIR, name));
        }
    }
    None
}

fn save_main_index(layout: &Layout, blog: &Blog, options: &Options, index: &Index) -> Result<()> {
    let mut page = page_header(
        blog,
        BACKUP_CSS_FILENAME,
        &blog.title,
        "index",
        &blog.subtitle,
        avatar_href(layout).as_deref(),
    );
    if options.tag_index && !index.is_empty() {
        page.push_str(&format!(
            "<p><a href={}/{}>Tag index</a></p>\n",
            TAG_INDEX_DIR, DIR_INDEX_FILENAME
        ));
    }

    // Newest year first, months ascending within it
    let mut years: Vec<i32> = index.months.keys().map(|(y, _)| *y).collect();
    years.dedup();
    years.reverse();
    for year in years {
        page.push_str(&format!("<h3>{}</h3>\n<ul>\n", year));
        for ((_, month), posts) in index.months.range((year, 1)..=(year, 12)) {
            let name = save_month_page(layout, blog, options, year, *month, posts)?;
            page.push_str(&format!(
                "    <li><a href={}/{} title=\"{} post(s)\">{}</a></li>\n",
                ARCHIVE_DIR,
                name,
                posts.len(),
                month_name(*month)
            ));
        }
        page.push_str("</ul>\n\n");
    }
    page.push_str(&format!(
        "<footer><p>Generated on {} by tumblr-vault.</p></footer>\n",
        chrono::Local::now().format("%x %X")
    ));

    write_atomic(
        &layout.root().join(DIR_INDEX_FILENAME),
        page.as_bytes(),
    )?;
    Ok(())
}

/// Writes one month's archive pages; returns the first page's file name
fn save_month_page(
    layout: &Layout,
    blog: &Blog,
    options: &Options,
    year: i32,
    month: u32,
    posts: &[LocalPost],
) -> Result<String> {
    let mut sorted: Vec<&LocalPost> = posts.iter().collect();
    sorted.sort_by_key(|p| std::cmp::Reverse(p.date));

    let per_page = if options.posts_per_page >= 1 {
        options.posts_per_page
    } else {
        sorted.len().max(1)
    };
    let page_count = sorted.len().div_ceil(per_page);
    let file_name = |page: usize| format!("{}-{:02}-p{}.html", year, month, page);

    for (n, chunk) in sorted.chunks(per_page).enumerate() {
        let page_no = n + 1;
        let mut page = page_header(
            blog,
            format!("../{}", BACKUP_CSS_FILENAME).as_str(),
            &format!("{} {}", month_name(month), year),
            "archive",
            "",
            None,
        );
        for post in chunk {
            match post.article_html() {
                Some(article) => page.push_str(&article),
                None => tracing::warn!("could not re-read saved post {}", post.ident),
            }
            page.push('\n');
        }

        page.push_str("<footer><nav>");
        page.push_str(&format!(
            "<a href=../{} rel=index>Index</a>\n",
            DIR_INDEX_FILENAME
        ));
        if page_no > 1 {
            page.push_str(&format!(
                "| <a href={} rel=prev>Previous</a>\n",
                file_name(page_no - 1)
            ));
        }
        if page_no < page_count {
            page.push_str(&format!(
                "| <a href={} rel=next>Next</a>\n",
                file_name(page_no + 1)
            ));
        }
        page.push_str("</nav></footer>\n");

        write_atomic(
            &layout.root().join(ARCHIVE_DIR).join(file_name(page_no)),
            page.as_bytes(),
        )?;
    }

    Ok(file_name(1))
}

/// The tag index: one digest-named directory per tag, listing its posts
fn save_tag_index(
    layout: &Layout,
    blog: &Blog,
    tag_indices: &BTreeMap<String, Index>,
) -> Result<()> {
    let mut listing = page_header(blog, format!("../{}", BACKUP_CSS_FILENAME).as_str(),
        "Tag index", "tag-index", &blog.title, None);
    listing.push_str("<ul>\n");

    for (tag, index) in tag_indices {
        let digest = hex::encode(Sha256::digest(tag.as_bytes()));
        let mut tag_page = page_header(
            blog,
            format!("../../{}", BACKUP_CSS_FILENAME).as_str(),
            &format!("Tag ‛{}’", xml_escape(tag)),
            "tag-archive",
            &blog.title,
            None,
        );
        tag_page.push_str("<ul>\n");
        for posts in index.months.values() {
            for post in posts {
                tag_page.push_str(&format!(
                    "    <li><a href=../../{}>{}</a></li>\n",
                    layout.post_href(post.ident),
                    post.ident
                ));
            }
        }
        tag_page.push_str("</ul>\n");
        write_atomic(
            &layout
                .root()
                .join(TAG_INDEX_DIR)
                .join(&digest)
                .join(DIR_INDEX_FILENAME),
            tag_page.as_bytes(),
        )?;

        listing.push_str(&format!(
            "    <li><a href={}/{}>{}</a></li>\n",
            digest,
            DIR_INDEX_FILENAME,
            xml_escape(tag)
        ));
    }
    listing.push_str("</ul>\n");
    write_atomic(
        &layout
            .root()
            .join(TAG_INDEX_DIR)
            .join(DIR_INDEX_FILENAME),
        listing.as_bytes(),
    )?;
    Ok(())
}

/// Captures the blog's avatar: previous archive first, then the network
fn get_avatar(
    layout: &Layout,
    client: &reqwest::blocking::Client,
    blog: &Blog,
    prev_archive: Option<&Path>,
    no_get: bool,
) {
    // Do not clobber an avatar we already have
    if avatar_href(layout).is_some() {
        return;
    }

    if let Some(prev) = prev_archive {
        if let Ok(entries) = std::fs::read_dir(prev.join(THEME_DIR)) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(AVATAR_BASE) {
                    let dest = layout.theme_dir().join(&name);
                    match std::fs::read(entry.path()) {
                        Ok(bytes) => {
                            if write_atomic(&dest, &bytes).is_ok() {
                                return; // we got the avatar
                            }
                        }
                        Err(e) => tracing::warn!("avatar copy failed: {}", e),
                    }
                }
            }
        }
    }
    if no_get {
        return;
    }

    let url = format!("https://api.tumblr.com/v2/blog/{}/avatar", blog.name);
    let resp = match client.get(&url).send() {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            tracing::warn!("error retrieving avatar: HTTP {}", resp.status().as_u16());
            return;
        }
        Err(e) => {
            tracing::warn!("error retrieving avatar: {}", e);
            return;
        }
    };
    let ext = match resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
    {
        t if t.contains("png") => ".png",
        t if t.contains("gif") => ".gif",
        t if t.contains("jpeg") || t.contains("jpg") => ".jpg",
        _ => "",
    };
    match resp.bytes() {
        Ok(bytes) => {
            let dest = layout.theme_dir().join(format!("{}{}", AVATAR_BASE, ext));
            if let Err(e) = write_atomic(&dest, &bytes) {
                tracing::warn!("error saving avatar: {}", e);
            }
        }
        Err(e) => tracing::warn!("error retrieving avatar: {}", e),
    }
}

/// Captures the blog's stylesheet by brute-forcing it from the home page;
/// the API has no method for getting the style directly
fn get_style(
    layout: &Layout,
    client: &reqwest::blocking::Client,
    blog: &Blog,
    prev_archive: Option<&Path>,
    no_get: bool,
) {
    let dest = layout.theme_dir().join("style.css");
    if dest.exists() {
        return;
    }

    if let Some(prev) = prev_archive {
        let src = prev.join(THEME_DIR).join("style.css");
        if let Ok(bytes) = std::fs::read(src) {
            if write_atomic(&dest, &bytes).is_ok() {
                return; // we got the style
            }
        }
    }
    if no_get {
        return;
    }

    let url = format!("https://{}/", blog.name);
    let body = match client.get(&url).send().and_then(|r| r.text()) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("URL is {}: error retrieving style: {}", url, e);
            return;
        }
    };

    let doc = Html::parse_document(&body);
    let Ok(selector) = Selector::parse("style") else {
        return;
    };
    for style in doc.select(&selector) {
        let css = style.text().collect::<String>();
        let css = css.trim();
        if !css.contains('\n') {
            continue;
        }
        let css = css.replace('\r', "").replace("\n    ", "\n");
        if let Err(e) = write_atomic(&dest, format!("{}\n", css).as_bytes()) {
            tracing::warn!("error saving style: {}", e);
        }
        return;
    }
}

fn month_name(month: u32) -> &'static str {
    match month {
        1 => "January",
        2 => "February",
        3 => "March",
        4 => "April",
        5 => "May",
        6 => "June",
        7 => "July",
        8 => "August",
        9 => "September",
        10 => "October",
        11 => "November",
        _ => "December",
    }
}

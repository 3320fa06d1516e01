//! Post rendering and saving
//!
//! Turns one parsed post record into a standalone HTML file, downloading
//! the media it references on the way. One `save_post` call is one work
//! item: it owns its post exclusively and shares nothing with other posts
//! except the media download registry.

pub mod index;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::DateTime;
use scraper::{Html, Selector};

use crate::archive::media::{maxsize_image_url, MediaDownloader, MediaRequest};
use crate::archive::state::MediaLog;
use crate::archive::{write_atomic, Layout};
use crate::backup::notes::NoteScraper;
use crate::backup::pool::TaskError;
use crate::config::Options;
use crate::post::{DialogueLine, PostKind, PostRecord};
use crate::{Result, VaultError};

/// The blog a backup pass is archiving
#[derive(Debug, Clone)]
pub struct Blog {
    /// The account name as given on the command line
    pub account: String,
    /// The full blog host name
    pub name: String,
    pub title: String,
    pub subtitle: String,
}

/// Escapes text for HTML attribute/content positions
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Renders and persists posts; shared by all pool workers
pub struct PostRenderer {
    pub layout: Layout,
    pub options: Options,
    pub blog: Blog,
    /// Common page header for post files
    pub post_header: String,
    pub media: MediaDownloader,
    pub media_log: Option<Arc<MediaLog>>,
    pub notes: Option<NoteScraper>,
}

impl PostRenderer {
    /// Saves one post: its JSON document (if asked), its rendered HTML,
    /// and its media list entry
    pub fn save_post(&self, post: &PostRecord) -> std::result::Result<(), TaskError> {
        if self.options.save_json && !self.options.reuse_json {
            write_atomic(&self.layout.json_path(post.id), post.json_content().as_bytes())
                .map_err(|e| classify_io(post.id, e))?;
        }

        let (html, media) = self.render_post(post).map_err(|e| classify(post.id, e))?;
        write_atomic(&self.layout.post_path(post.id), html.as_bytes())
            .map_err(|e| classify_io(post.id, e))?;

        if let Some(log) = &self.media_log {
            log.record(post.id, &media).map_err(|e| classify_io(post.id, e))?;
        }
        Ok(())
    }

    /// Renders one post to HTML, returning the media URLs it references
    pub fn render_post(&self, post: &PostRecord) -> Result<(String, BTreeSet<String>)> {
        let mut media = BTreeSet::new();
        let mut title = String::new();
        let content = self.render_content(post, &mut title, &mut media)?;

        let likes = self.options.likes;
        let typ = format!("{}{}", if likes { "liked-" } else { "" }, post.type_name);
        let isodate = format_iso(post.date(likes));
        let display_date = format_display(post.date(likes));

        let mut html = self.post_header.clone();
        html.push_str(&format!("<article class={} id=p-{}>\n", typ, post.id));
        html.push_str("<header>\n");
        if likes {
            html.push_str(&format!(
                "<p><a href=\"https://{0}.tumblr.com/\" class=\"tumblr_blog\">{0}</a>:</p>\n",
                post.blog_name
            ));
        }
        html.push_str(&format!(
            "<p><time datetime={}>{}</time>\n",
            isodate, display_date
        ));
        html.push_str(&format!(
            "<a class=llink href={}/{}>¶</a>\n",
            self.layout.root_href(),
            self.layout.post_href(post.id)
        ));
        if let Some(short) = &post.short_url {
            html.push_str(&format!("<a href={}>●</a>\n", short));
        }
        if let (Some(from), root) = (&post.reblogged_from, &post.reblogged_root) {
            if root.as_ref() != Some(from) {
                html.push_str(&format!("<a href={}>⬀</a>\n", from));
            }
        }
        if let Some(root) = &post.reblogged_root {
            html.push_str(&format!("<a href={}>⬈</a>\n", root));
        }
        html.push_str("</header>\n");

        if !title.is_empty() {
            html.push_str(&format!("<h2>{}</h2>\n", title));
        }
        html.push_str(&content);

        let mut foot = Vec::new();
        if !post.tags.is_empty() {
            foot.push(
                post.tags
                    .iter()
                    .map(|t| self.tag_link(t))
                    .collect::<String>(),
            );
        }
        if let (Some(source_title), Some(source_url)) = (&post.source_title, &post.source_url) {
            foot.push(format!(
                "<a title=Source href={}>{}</a>",
                source_url, source_title
            ));
        }

        let notes_html = self.scraped_notes(post);
        let notes_str = format!(
            "{} note{}",
            post.note_count,
            if post.note_count == 1 { "" } else { "s" }
        );
        match notes_html {
            Some(notes) => {
                foot.push(format!("<details><summary>{}</summary>\n", notes_str));
                foot.push("<ol class=\"notes\">".to_string());
                foot.push(notes);
                foot.push("</ol></details>".to_string());
            }
            None => foot.push(notes_str),
        }

        if !foot.is_empty() {
            html.push_str(&format!("\n<footer>{}</footer>", foot.join("\n")));
        }
        html.push_str("\n</article>\n");

        Ok((html, media))
    }

    fn scraped_notes(&self, post: &PostRecord) -> Option<String> {
        if !self.options.save_notes {
            return None;
        }
        let notes = self.notes.as_ref()?;
        let url = post.url.as_deref()?;
        notes.scrape(&self.blog.account, url, post.id)
    }

    /// The type-specific content block; exhaustive over the post union
    fn render_content(
        &self,
        post: &PostRecord,
        title: &mut String,
        media: &mut BTreeSet<String>,
    ) -> Result<String> {
        let mut content: Vec<String> = Vec::new();

        match &post.kind {
            PostKind::Text { title: t, body } => {
                if let Some(t) = t {
                    *title = t.clone();
                }
                if let Some(body) = body {
                    content.push(self.rewrite_inline_images(post, body, media)?);
                }
            }

            PostKind::Photo {
                photos,
                link_url,
                caption,
            } => {
                let is_photoset = photos.len() > 1;
                for (n, photo) in photos.iter().enumerate() {
                    let offset = if is_photoset { n + 1 } else { 0 };
                    let src = self.image_href(post, &photo.url, offset, media)?;
                    let mut img = format!("<img alt=\"\" src=\"{}\">", xml_escape(&src));
                    if let Some(link) = link_url {
                        img = format!("<a href=\"{}\">{}</a>", xml_escape(link), img);
                    }
                    content.push(format!("<p>{}</p>", img));
                    if let Some(caption) = &photo.caption {
                        if !caption.is_empty() {
                            content.push(format!("<p>{}</p>", caption));
                        }
                    }
                }
                if let Some(caption) = caption {
                    content.push(self.rewrite_inline_images(post, caption, media)?);
                }
            }

            PostKind::Link {
                url,
                title: t,
                description,
            } => {
                *title = format!(
                    "<a href=\"{}\">{}</a>",
                    xml_escape(url),
                    t.clone().unwrap_or_else(|| url.clone())
                );
                if let Some(description) = description {
                    content.push(self.rewrite_inline_images(post, description, media)?);
                }
            }

            PostKind::Quote { text, source } => {
                content.push(format!("<blockquote><p>{}</p></blockquote>", text));
                if let Some(source) = source {
                    content.push(format!("<p>{}</p>", source));
                }
            }

            PostKind::Video {
                video_type,
                video_url,
                embed,
                caption,
            } => {
                let mut src = String::new();
                if self.options.save_video && video_type.as_deref() == Some("tumblr") {
                    if let Some(url) = video_url {
                        src = self.media_href_for(post, url, Some(".mp4"), media)?;
                    }
                }
                if !src.is_empty() {
                    content.push(format!(
                        "<p><video controls><source src=\"{src}\" type=video/mp4>\
                         Your browser does not support the video element.<br>\n\
                         <a href=\"{src}\">Video file</a></video></p>"
                    ));
                } else if let Some(embed) = embed {
                    content.push(embed.clone());
                } else if let Some(url) = video_url {
                    content.push(url.clone());
                }
                if let Some(caption) = caption {
                    content.push(self.rewrite_inline_images(post, caption, media)?);
                }
            }

            PostKind::Audio {
                audio_type,
                audio_url,
                player,
                caption,
            } => {
                let mut src = None;
                if self.options.save_audio {
                    if let Some(url) = audio_url {
                        if matches!(audio_type.as_deref(), Some("tumblr") | Some("soundcloud")) {
                            let href = self.media_href_for(post, url, Some(".mp3"), media)?;
                            if href != *url {
                                src = Some(href);
                            }
                        }
                    }
                }
                if let Some(src) = src {
                    content.push(audio_player(&src));
                } else if let Some(player) = player {
                    content.push(player.clone());
                } else if let Some(url) = audio_url {
                    content.push(audio_player(url));
                }
                if let Some(caption) = caption {
                    content.push(self.rewrite_inline_images(post, caption, media)?);
                }
            }

            PostKind::Answer { question, answer } => {
                *title = question.clone();
                if let Some(answer) = answer {
                    content.push(self.rewrite_inline_images(post, answer, media)?);
                }
            }

            PostKind::Chat { title: t, dialogue } => {
                if let Some(t) = t {
                    *title = t.clone();
                }
                content.push(format!(
                    "<p>{}</p>",
                    dialogue
                        .iter()
                        .map(|DialogueLine { label, phrase }| format!("{} {}", label, phrase))
                        .collect::<Vec<_>>()
                        .join("<br>\n")
                ));
            }

            PostKind::Unknown { type_name } => {
                tracing::warn!("unknown post type '{}' in post #{}", type_name, post.id);
                content.push(format!(
                    "<pre>{}</pre>",
                    xml_escape(&post.json_content())
                ));
            }
        }

        Ok(content.join("\n"))
    }

    /// Local href for an image, downloading it when asked; falls back to
    /// the remote URL on download failure
    fn image_href(
        &self,
        post: &PostRecord,
        url: &str,
        offset: usize,
        media: &mut BTreeSet<String>,
    ) -> Result<String> {
        if !self.options.save_images {
            return Ok(url.to_string());
        }
        let url = maxsize_image_url(url);
        media.insert(url.clone());
        let offset = if offset > 0 {
            format!("_o{}", offset)
        } else {
            String::new()
        };
        let req = MediaRequest {
            url: &url,
            ident: post.id,
            blog: &self.blog.account,
            offset,
            extension: None,
            filename: None,
        };
        Ok(match self.media.download(&req)? {
            Some(name) => format!("{}/{}", self.layout.media_href(post.id), name),
            None => url,
        })
    }

    /// Local href for a direct media file (video/audio), with a forced
    /// extension
    fn media_href_for(
        &self,
        post: &PostRecord,
        url: &str,
        extension: Option<&str>,
        media: &mut BTreeSet<String>,
    ) -> Result<String> {
        media.insert(url.to_string());
        let req = MediaRequest {
            url,
            ident: post.id,
            blog: &self.blog.account,
            offset: String::new(),
            extension,
            filename: None,
        };
        Ok(match self.media.download(&req)? {
            Some(name) => format!("{}/{}", self.layout.media_href(post.id), name),
            None => url.to_string(),
        })
    }

    /// Downloads the images inlined in an HTML fragment and points their
    /// `src` attributes at the local copies
    fn rewrite_inline_images(
        &self,
        post: &PostRecord,
        fragment: &str,
        media: &mut BTreeSet<String>,
    ) -> Result<String> {
        if !self.options.save_images || !fragment.contains("<img") {
            return Ok(fragment.to_string());
        }

        let sources: Vec<String> = {
            let doc = Html::parse_fragment(fragment);
            let Ok(selector) = Selector::parse("img[src]") else {
                return Ok(fragment.to_string());
            };
            doc.select(&selector)
                .filter_map(|img| img.value().attr("src"))
                .map(str::to_string)
                .collect()
        };

        let mut rewritten = fragment.to_string();
        for src in sources {
            let mut url = src.clone();
            if url.starts_with("//") {
                url = format!("https:{}", url);
            }
            if !url.starts_with("http") {
                continue;
            }
            let url = maxsize_image_url(&url);
            let Some(filename) = url
                .rsplit('/')
                .next()
                .map(|name| name.split('?').next().unwrap_or(name))
                .filter(|name| !name.is_empty())
            else {
                continue;
            };
            media.insert(url.clone());
            let req = MediaRequest {
                url: &url,
                ident: post.id,
                blog: &self.blog.account,
                offset: String::new(),
                extension: None,
                filename: Some(filename),
            };
            if let Some(name) = self.media.download(&req)? {
                let local = format!("{}/{}", self.layout.media_href(post.id), name);
                rewritten = rewritten.replace(&src, &local);
            }
        }
        Ok(rewritten)
    }

    fn tag_link(&self, tag: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(tag.as_bytes()).collect();
        format!(
            "<a href=https://{}/tagged/{}>{}</a>\n",
            self.blog.name,
            encoded,
            xml_escape(&format!("#{}", tag))
        )
    }
}

fn audio_player(src: &str) -> String {
    format!(
        "<p><audio controls><source src=\"{src}\" type=audio/mpeg>\
         Your browser does not support the audio element.<br>\n\
         <a href=\"{src}\">Audio file</a></audio></p>"
    )
}

fn classify_io(ident: u64, e: std::io::Error) -> TaskError {
    if crate::archive::is_disk_full(&e) {
        TaskError::DiskFull
    } else {
        TaskError::Failed(format!("caught exception while saving post {}: {}", ident, e))
    }
}

fn classify(ident: u64, e: VaultError) -> TaskError {
    match e {
        VaultError::Io(io) => classify_io(ident, io),
        other => TaskError::Failed(format!(
            "caught exception while saving post {}: {}",
            ident, other
        )),
    }
}

/// The common HTML page header
pub fn page_header(
    blog: &Blog,
    css_rel: &str,
    title: &str,
    body_class: &str,
    subtitle: &str,
    avatar_href: Option<&str>,
) -> String {
    let body_class = if body_class.is_empty() {
        String::new()
    } else {
        format!(" class={}", body_class)
    };
    let mut h = format!(
        "<!DOCTYPE html>\n\n<meta charset=utf-8>\n<title>{}</title>\n\
         <link rel=stylesheet href={}>\n\n<body{}>\n\n<header>\n",
        xml_escape(&blog.title),
        css_rel,
        body_class
    );
    if let Some(avatar) = avatar_href {
        h.push_str(&format!("<img src={} alt=Avatar>\n", avatar));
    }
    if !title.is_empty() {
        h.push_str(&format!("<h1>{}</h1>\n", title));
    }
    if !subtitle.is_empty() {
        h.push_str(&format!("<p class=subtitle>{}</p>\n", subtitle));
    }
    h.push_str("</header>\n");
    h
}

fn format_iso(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

fn format_display(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%x %X").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::coord::Coord;
    use serde_json::json;
    use tempfile::tempdir;

    fn renderer(root: &std::path::Path, options: Options) -> PostRenderer {
        let layout = Layout::new(root.to_path_buf(), &options);
        let coord = Coord::new();
        let client = crate::source::build_client(None).unwrap();
        let media = MediaDownloader::new(client, coord, layout.clone(), &options, None);
        PostRenderer {
            layout,
            options,
            blog: Blog {
                account: "example".to_string(),
                name: "example.tumblr.com".to_string(),
                title: "Example".to_string(),
                subtitle: String::new(),
            },
            post_header: page_header(
                &Blog {
                    account: "example".to_string(),
                    name: "example.tumblr.com".to_string(),
                    title: "Example".to_string(),
                    subtitle: String::new(),
                },
                "../backup.css",
                "",
                "post",
                "",
                None,
            ),
            media,
            media_log: None,
            notes: None,
        }
    }

    fn text_post(id: u64, timestamp: i64) -> PostRecord {
        PostRecord::parse(json!({
            "id": id,
            "timestamp": timestamp,
            "type": "text",
            "tags": ["rust"],
            "blog_name": "example",
            "post_url": format!("https://example.tumblr.com/post/{}", id),
            "short_url": format!("https://tmblr.co/{}", id),
            "title": "Hello",
            "body": "<p>World</p>",
            "note_count": 1,
        }))
        .unwrap()
    }

    #[test]
    fn test_render_text_post() {
        let dir = tempdir().unwrap();
        let r = renderer(dir.path(), Options::default());
        let (html, media) = r.render_post(&text_post(42, 1591012800)).unwrap();

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<article class=text id=p-42>"));
        assert!(html.contains("<time datetime=2020-06-01T12:00:00Z>"));
        assert!(html.contains("<h2>Hello</h2>"));
        assert!(html.contains("<p>World</p>"));
        assert!(html.contains("/tagged/rust"));
        assert!(html.contains("1 note"));
        assert!(media.is_empty());
    }

    #[test]
    fn test_render_quote_and_chat() {
        let dir = tempdir().unwrap();
        let r = renderer(dir.path(), Options::default());

        let quote = PostRecord::parse(json!({
            "id": 1, "timestamp": 1, "type": "quote",
            "text": "words", "source": "someone",
        }))
        .unwrap();
        let (html, _) = r.render_post(&quote).unwrap();
        assert!(html.contains("<blockquote><p>words</p></blockquote>"));

        let chat = PostRecord::parse(json!({
            "id": 2, "timestamp": 1, "type": "chat",
            "dialogue": [{"label": "A:", "phrase": "hi"}, {"label": "B:", "phrase": "yo"}],
        }))
        .unwrap();
        let (html, _) = r.render_post(&chat).unwrap();
        assert!(html.contains("A: hi<br>\nB: yo"));
    }

    #[test]
    fn test_render_photo_without_downloads_keeps_remote_urls() {
        let dir = tempdir().unwrap();
        let r = renderer(dir.path(), Options::default()); // save_images off
        let post = PostRecord::parse(json!({
            "id": 3, "timestamp": 1, "type": "photo",
            "photos": [{"original_size": {"url": "https://media.example/a.jpg"}, "caption": ""}],
        }))
        .unwrap();
        let (html, media) = r.render_post(&post).unwrap();
        assert!(html.contains("src=\"https://media.example/a.jpg\""));
        assert!(media.is_empty(), "no downloads attempted, none recorded");
    }

    #[test]
    fn test_render_unknown_type_dumps_json() {
        let dir = tempdir().unwrap();
        let r = renderer(dir.path(), Options::default());
        let post = PostRecord::parse(json!({"id": 4, "timestamp": 1, "type": "widget"}))
            .unwrap();
        let (html, _) = r.render_post(&post).unwrap();
        assert!(html.contains("<pre>"));
        assert!(html.contains("widget"));
    }

    #[test]
    fn test_save_post_writes_files_atomically() {
        let dir = tempdir().unwrap();
        let mut options = Options::default();
        options.save_json = true;
        let r = renderer(dir.path(), options);
        r.save_post(&text_post(7, 1591012800)).unwrap();

        assert!(dir.path().join("posts/7.html").exists());
        assert!(dir.path().join("json/7.json").exists());
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("json/7.json")).unwrap())
                .unwrap();
        assert_eq!(json["id"], 7);
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}

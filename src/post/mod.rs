//! Post records and the closed post-type union
//!
//! A raw API document is parsed once into a [`PostRecord`]: the common
//! fields every post carries plus a [`PostKind`] variant holding only the
//! fields relevant to its type. The renderer matches the union
//! exhaustively; there is no dynamic field access past this boundary.

use serde_json::Value;

use crate::VaultError;

/// One photo of a photo post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Photo {
    /// URL of the largest available size
    pub url: String,
    pub caption: Option<String>,
}

/// One line of a chat post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueLine {
    pub label: String,
    pub phrase: String,
}

/// Type-specific post content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostKind {
    Text {
        title: Option<String>,
        body: Option<String>,
    },
    Photo {
        photos: Vec<Photo>,
        link_url: Option<String>,
        caption: Option<String>,
    },
    Link {
        url: String,
        title: Option<String>,
        description: Option<String>,
    },
    Quote {
        text: String,
        source: Option<String>,
    },
    Video {
        /// `tumblr` for natively hosted video
        video_type: Option<String>,
        video_url: Option<String>,
        embed: Option<String>,
        caption: Option<String>,
    },
    Audio {
        audio_type: Option<String>,
        audio_url: Option<String>,
        player: Option<String>,
        caption: Option<String>,
    },
    Answer {
        question: String,
        answer: Option<String>,
    },
    Chat {
        title: Option<String>,
        dialogue: Vec<DialogueLine>,
    },
    /// A type this tool does not know; rendered as its raw JSON
    Unknown { type_name: String },
}

/// One post as fetched from the API or a replay archive
///
/// Immutable once parsed; the raw document is kept alongside the parsed
/// fields for JSON export and filter evaluation.
#[derive(Debug, Clone)]
pub struct PostRecord {
    pub raw: Value,
    pub id: u64,
    pub timestamp: i64,
    pub liked_timestamp: Option<i64>,
    pub type_name: String,
    pub kind: PostKind,
    pub tags: Vec<String>,
    pub blog_name: String,
    pub url: Option<String>,
    pub short_url: Option<String>,
    pub reblogged_from: Option<String>,
    pub reblogged_root: Option<String>,
    pub source_title: Option<String>,
    pub source_url: Option<String>,
    pub note_count: u64,
}

impl PostRecord {
    /// Parses a raw API document
    pub fn parse(raw: Value) -> Result<Self, VaultError> {
        let id = raw
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| VaultError::MalformedPost("missing numeric 'id'".to_string()))?;
        let timestamp = raw
            .get("timestamp")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                VaultError::MalformedPost(format!("post {}: missing 'timestamp'", id))
            })?;
        let type_name = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| VaultError::MalformedPost(format!("post {}: missing 'type'", id)))?
            .to_string();

        let tags = raw
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // Note counts appear either flat or nested depending on the endpoint
        let note_count = raw
            .get("note_count")
            .and_then(Value::as_u64)
            .or_else(|| raw.pointer("/notes/count").and_then(Value::as_u64))
            .unwrap_or(0);

        let blog_name = raw
            .get("blog_name")
            .or_else(|| raw.get("tumblelog"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let kind = parse_kind(&type_name, &raw);

        Ok(Self {
            id,
            timestamp,
            liked_timestamp: raw.get("liked_timestamp").and_then(Value::as_i64),
            type_name,
            kind,
            tags,
            blog_name,
            url: get_string(&raw, "post_url"),
            short_url: get_string(&raw, "short_url"),
            reblogged_from: get_string(&raw, "reblogged_from_url"),
            reblogged_root: get_string(&raw, "reblogged_root_url"),
            source_title: get_string(&raw, "source_title"),
            source_url: get_string(&raw, "source_url"),
            note_count,
            raw,
        })
    }

    /// The date this post sorts and filters by
    pub fn date(&self, likes: bool) -> i64 {
        if likes {
            self.liked_timestamp.unwrap_or(self.timestamp)
        } else {
            self.timestamp
        }
    }

    /// The pagination key: liked timestamp in likes mode, id otherwise
    pub fn key(&self, likes: bool) -> i64 {
        if likes {
            self.liked_timestamp.unwrap_or(self.timestamp)
        } else {
            self.id as i64
        }
    }

    /// Whether this post is a reblog of another post
    pub fn is_reblog(&self) -> bool {
        self.reblogged_from.is_some()
            || self.raw.get("reblogged_from_id").is_some_and(|v| !v.is_null())
    }

    /// The raw document pretty-printed, for `json/<id>.json` exports
    pub fn json_content(&self) -> String {
        serde_json::to_string_pretty(&self.raw).unwrap_or_else(|_| "{}".to_string())
    }
}

fn get_string(raw: &Value, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_kind(type_name: &str, raw: &Value) -> PostKind {
    match type_name {
        "text" => PostKind::Text {
            title: get_string(raw, "title"),
            body: get_string(raw, "body"),
        },
        "photo" => PostKind::Photo {
            photos: parse_photos(raw),
            link_url: get_string(raw, "link_url"),
            caption: get_string(raw, "caption"),
        },
        "link" => PostKind::Link {
            url: get_string(raw, "url").unwrap_or_default(),
            title: get_string(raw, "title"),
            description: get_string(raw, "description"),
        },
        "quote" => PostKind::Quote {
            text: get_string(raw, "text").unwrap_or_default(),
            source: get_string(raw, "source"),
        },
        "video" => PostKind::Video {
            video_type: get_string(raw, "video_type"),
            video_url: get_string(raw, "video_url"),
            embed: raw
                .get("player")
                .and_then(Value::as_array)
                .and_then(|p| p.last())
                .and_then(|p| p.get("embed_code"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            caption: get_string(raw, "caption"),
        },
        "audio" => PostKind::Audio {
            audio_type: get_string(raw, "audio_type"),
            audio_url: get_string(raw, "audio_url").or_else(|| get_string(raw, "audio_source_url")),
            player: get_string(raw, "player"),
            caption: get_string(raw, "caption"),
        },
        "answer" => PostKind::Answer {
            question: get_string(raw, "question").unwrap_or_default(),
            answer: get_string(raw, "answer"),
        },
        "chat" => PostKind::Chat {
            title: get_string(raw, "title"),
            dialogue: raw
                .get("dialogue")
                .and_then(Value::as_array)
                .map(|lines| {
                    lines
                        .iter()
                        .map(|line| DialogueLine {
                            label: get_string(line, "label").unwrap_or_default(),
                            phrase: get_string(line, "phrase").unwrap_or_default(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        },
        other => PostKind::Unknown {
            type_name: other.to_string(),
        },
    }
}

/// Photo posts carry one or more photos; prefer `alt_sizes[0]` (the largest
/// alternative) and fall back to `original_size`
fn parse_photos(raw: &Value) -> Vec<Photo> {
    raw.get("photos")
        .and_then(Value::as_array)
        .map(|photos| {
            photos
                .iter()
                .filter_map(|p| {
                    let url = p
                        .pointer("/alt_sizes/0/url")
                        .or_else(|| p.pointer("/original_size/url"))
                        .and_then(Value::as_str)?;
                    Some(Photo {
                        url: url.to_string(),
                        caption: get_string(p, "caption"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

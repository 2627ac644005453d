use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{session::SessionContext, util};

/// Marker of the embedded client-state block on play pages.
const STATE_MARKER: &str = "id=\"__NEXT_DATA__\"";

const SSRLOG_PTR: &str = "/props/initialProps/pageProps/prePlayerData/ssrlog";
const PLAYLIST_PTR: &str = "/props/initialState/play/cachePlayList/1";
const ALBUM_INFO_PTR: &str = "/props/initialState/album/videoAlbumInfo";
const VIDEO_INFO_PTR: &str = "/props/initialState/play/videoInfo";

#[derive(thiserror::Error, Debug)]
pub enum PageStateError {
    #[error("could not download page")]
    Download(#[from] util::DownloadError),
    #[error("no embedded state block found")]
    NoStateBlock,
    #[error("more than one embedded state block found")]
    AmbiguousStateBlock,
    #[error("could not parse embedded state block")]
    Parse(#[from] serde_json::Error),
}

/// Parsed tree of a page's embedded client-state. The upstream schema varies
/// by content type, so every accessor is null-safe; callers never assume a
/// path exists.
#[derive(Debug, Clone)]
pub struct PageState {
    pub url: String,
    root: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Episode,
    Preview,
    Trailer,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpisodeDescriptor {
    pub title: String,
    pub ordinal: Option<u32>,
    pub url: String,
    pub kind: ContentKind,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub duration_secs: Option<u64>,
    pub is_valid: bool,
}

/// One row of an ordered extraction table. Rows are evaluated in order until
/// the first structurally valid match; new upstream fields are supported by
/// appending a row.
struct FieldRule {
    name: &'static str,
    key: &'static str,
}

const TITLE_RULES: &[FieldRule] = &[
    FieldRule { name: "name", key: "name" },
    FieldRule { name: "sub-title", key: "subTitle" },
    FieldRule { name: "alter-title", key: "alterTitle" },
    FieldRule { name: "album-name", key: "albumName" },
];

const DESCRIPTION_RULES: &[FieldRule] = &[
    FieldRule { name: "description", key: "description" },
    FieldRule { name: "desc", key: "desc" },
    FieldRule { name: "brief", key: "brief" },
    FieldRule { name: "play-desc", key: "playDesc" },
    FieldRule { name: "sub-title", key: "subTitle" },
];

const THUMBNAIL_RULES: &[FieldRule] = &[
    FieldRule { name: "img-url", key: "imgUrl" },
    FieldRule { name: "thumbnail-1", key: "thumbnailUrl1" },
    FieldRule { name: "thumbnail-2", key: "thumbnailUrl2" },
    FieldRule { name: "thumbnail-3", key: "thumbnailUrl3" },
];

const DURATION_RULES: &[FieldRule] = &[
    FieldRule { name: "iso-duration", key: "isoDuration" },
    FieldRule { name: "duration", key: "duration" },
    FieldRule { name: "play-time", key: "playTime" },
    FieldRule { name: "length", key: "length" },
];

const PREVIEW_KEYWORDS: &[&str] = &[
    "预告",
    "先行版",
    "预览",
    "preview",
    "sneak peek",
    "next episode",
    "coming soon",
];

const TRAILER_KEYWORDS: &[&str] = &["trailer", "teaser", "promo"];

fn get_state_str(html: &str) -> Result<&str, PageStateError> {
    let idx_marker = html.find(STATE_MARKER).ok_or(PageStateError::NoStateBlock)?;
    let after = idx_marker + STATE_MARKER.len();

    if html[after..].contains(STATE_MARKER) {
        return Err(PageStateError::AmbiguousStateBlock);
    }

    let idx_open = html[after..]
        .find('>')
        .map(|i| after + i + 1)
        .ok_or(PageStateError::NoStateBlock)?;
    let idx_close = html[idx_open..]
        .find("</script>")
        .map(|i| idx_open + i)
        .ok_or(PageStateError::NoStateBlock)?;

    Ok(html[idx_open..idx_close].trim())
}

fn classify_title(title: &str) -> ContentKind {
    let lower = title.to_lowercase();
    if TRAILER_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return ContentKind::Trailer;
    }
    if PREVIEW_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return ContentKind::Preview;
    }
    ContentKind::Episode
}

fn nonempty_string(v: &Value) -> Option<String> {
    let s = v.as_str()?.trim();
    if s.is_empty() || matches!(s.to_lowercase().as_str(), "null" | "none" | "undefined") {
        return None;
    }
    Some(s.to_string())
}

fn apply_rules(obj: &Value, rules: &[FieldRule]) -> Option<String> {
    rules.iter().find_map(|rule| {
        let value = obj.get(rule.key).and_then(nonempty_string)?;
        trace!("extraction rule {} matched", rule.name);
        Some(value)
    })
}

fn absolutize(url: &str, site_base: &str) -> String {
    if url.starts_with("//") {
        format!("https:{}", url)
    } else if url.starts_with('/') {
        format!("{}{}", site_base, url)
    } else {
        url.to_string()
    }
}

/// Durations show up as `MM:SS`, `HH:MM:SS`, plain seconds, or ISO-8601
/// `PT..H..M..S`, depending on which field the upstream populated.
fn parse_duration_secs(raw: &str) -> Option<u64> {
    let raw = raw.trim();

    if let Some(rest) = raw.strip_prefix("PT") {
        let re = Regex::new(r"^(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?$").ok()?;
        let caps = re.captures(rest)?;
        let part = |i: usize| {
            caps.get(i)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .unwrap_or(0)
        };
        let total = part(1) * 3600 + part(2) * 60 + part(3);
        return (total > 0).then_some(total);
    }

    if raw.contains(':') {
        let parts: Vec<&str> = raw.split(':').collect();
        let nums: Option<Vec<u64>> = parts.iter().map(|p| p.parse().ok()).collect();
        let nums = nums?;
        let total = match nums.as_slice() {
            [m, s] => m * 60 + s,
            [h, m, s] => h * 3600 + m * 60 + s,
            _ => return None,
        };
        return (total > 0).then_some(total);
    }

    let secs = raw.parse::<u64>().ok()?;
    (secs > 0).then_some(secs)
}

fn duration_from(obj: &Value, rules: &[FieldRule]) -> Option<u64> {
    rules.iter().find_map(|rule| {
        let v = obj.get(rule.key)?;
        if let Some(n) = v.as_u64() {
            return (n > 0).then_some(n);
        }
        parse_duration_secs(v.as_str()?)
    })
}

pub(crate) fn ordinal_from_title(title: &str) -> Option<u32> {
    let re = Regex::new(r"(?i)(?:episode|ep)\s*(\d+)|第(\d+)集").ok()?;
    let caps = re.captures(title)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

impl PageState {
    pub fn from_html(url: &str, html: &str) -> Result<Self, PageStateError> {
        let state_str = get_state_str(html)?;
        let root = serde_json::from_str(state_str)?;
        Ok(Self {
            url: url.to_string(),
            root,
        })
    }

    /// Null-safe navigation into an optional nested path.
    pub fn at(&self, pointer: &str) -> Option<&Value> {
        match self.root.pointer(pointer) {
            Some(Value::Null) => None,
            other => other,
        }
    }

    /// The free-text server-side-render log. The signed resolution token is
    /// buried in here; see `query`.
    pub fn ssrlog(&self) -> Option<&str> {
        self.at(SSRLOG_PTR)?.as_str()
    }

    pub fn album_description(&self) -> Option<String> {
        self.at(ALBUM_INFO_PTR)
            .and_then(|album| album.get("desc"))
            .and_then(nonempty_string)
    }

    /// The episode currently loaded on this page, if the schema exposes one.
    pub fn current_episode(&self) -> Option<EpisodeDescriptor> {
        let play = self.at("/props/initialState/play")?;
        let info = ["curVideoInfo", "videoInfo", "episodeInfo"]
            .iter()
            .find_map(|key| play.get(*key).filter(|v| v.is_object()))?;

        let title = apply_rules(info, TITLE_RULES)?;
        Some(self.descriptor_from(info, title, self.url.clone(), None))
    }

    /// All episodes listed in the page's playlist cache, previews and
    /// trailers classified, duplicate ordinals dropped.
    pub fn episode_list(&self, ctx: &SessionContext) -> Vec<EpisodeDescriptor> {
        let Some(entries) = self.at(PLAYLIST_PTR).and_then(|v| v.as_array()) else {
            return Vec::new();
        };

        let mut seen = std::collections::HashSet::new();
        let mut episodes = Vec::new();

        for (position, entry) in entries.iter().enumerate() {
            let Some(title) = apply_rules(entry, TITLE_RULES) else {
                continue;
            };

            let url = entry
                .get("albumPlayUrl")
                .and_then(nonempty_string)
                .map(|u| absolutize(&u, &ctx.site_base))
                .unwrap_or_else(|| self.url.clone());

            let ordinal = ordinal_from_title(&title).or(Some(position as u32 + 1));
            let descriptor = self.descriptor_from(entry, title, url, ordinal);

            if descriptor.kind == ContentKind::Episode {
                if let Some(ord) = descriptor.ordinal {
                    if !seen.insert(ord) {
                        debug!("dropping duplicate ordinal {}", ord);
                        continue;
                    }
                }
            }
            episodes.push(descriptor);
        }

        episodes.sort_by_key(|e| e.ordinal.unwrap_or(u32::MAX));
        episodes
    }

    fn descriptor_from(
        &self,
        obj: &Value,
        title: String,
        url: String,
        ordinal: Option<u32>,
    ) -> EpisodeDescriptor {
        let kind = classify_title(&title);
        let description = apply_rules(obj, DESCRIPTION_RULES)
            .filter(|d| d != &title)
            .or_else(|| self.album_description());
        let thumbnail = apply_rules(obj, THUMBNAIL_RULES)
            .or_else(|| {
                self.at(VIDEO_INFO_PTR)
                    .and_then(|info| apply_rules(info, THUMBNAIL_RULES))
            })
            .map(|t| {
                if t.starts_with("http") {
                    t
                } else {
                    format!("https:{}", t)
                }
            });
        let duration_secs = duration_from(obj, DURATION_RULES).or_else(|| {
            self.at(VIDEO_INFO_PTR)
                .and_then(|info| duration_from(info, DURATION_RULES))
        });
        let ordinal = ordinal.or_else(|| ordinal_from_title(&title));

        EpisodeDescriptor {
            title,
            ordinal,
            url,
            kind,
            description,
            thumbnail,
            duration_secs,
            is_valid: false,
        }
    }
}

/// Per-run memoization of fetched pages, keyed by URL. A page is fetched at
/// most once per resolution run, even when a degraded strategy goes back to
/// the raw text after state parsing failed. This is the only cross-episode
/// shared state.
pub struct PageCache {
    html: Mutex<HashMap<String, Arc<String>>>,
    states: Mutex<HashMap<String, Arc<PageState>>>,
}

impl PageCache {
    pub fn new() -> Self {
        Self {
            html: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_html(
        &self,
        client: &util::HttpClient,
        url: &str,
    ) -> Result<Arc<String>, PageStateError> {
        if let Some(html) = self.html.lock().await.get(url) {
            debug!("page cache hit for {}", url);
            return Ok(html.clone());
        }

        let html = Arc::new(client.fetch_text(url).await?);
        self.html
            .lock()
            .await
            .insert(url.to_string(), html.clone());
        Ok(html)
    }

    pub async fn get_state(
        &self,
        client: &util::HttpClient,
        url: &str,
    ) -> Result<Arc<PageState>, PageStateError> {
        if let Some(state) = self.states.lock().await.get(url) {
            return Ok(state.clone());
        }

        let html = self.get_html(client, url).await?;
        let state = Arc::new(PageState::from_html(url, &html)?);

        self.states
            .lock()
            .await
            .insert(url.to_string(), state.clone());
        Ok(state)
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(json: &str) -> String {
        format!(
            r#"<html><head><script id="__NEXT_DATA__" type="application/json">{}</script></head></html>"#,
            json
        )
    }

    #[test]
    fn state_str() {
        let html = wrap(r#"{"props": {}}"#);
        let result = get_state_str(&html).expect("could not find state block");
        assert_eq!(result, r#"{"props": {}}"#);

        assert!(matches!(
            get_state_str("<html><body>nothing here</body></html>"),
            Err(PageStateError::NoStateBlock)
        ));

        let twice = format!("{}{}", wrap("{}"), wrap("{}"));
        assert!(matches!(
            get_state_str(&twice),
            Err(PageStateError::AmbiguousStateBlock)
        ));
    }

    #[test]
    fn malformed_state_is_parse_error() {
        let html = wrap(r#"{"props": "#);
        assert!(matches!(
            PageState::from_html("http://x", &html),
            Err(PageStateError::Parse(_))
        ));
    }

    #[test]
    fn null_safe_navigation() {
        let html = wrap(r#"{"props": {"initialState": {"play": null}}}"#);
        let state = PageState::from_html("http://x", &html).unwrap();

        assert!(state.at("/props/initialState").is_some());
        assert!(state.at("/props/initialState/play").is_none());
        assert!(state.at("/props/missing/deeply/nested").is_none());
        assert!(state.ssrlog().is_none());
    }

    #[test]
    fn ssrlog_accessor() {
        let html = wrap(
            r#"{"props": {"initialProps": {"pageProps": {"prePlayerData": {"ssrlog": "line one\nline two"}}}}}"#,
        );
        let state = PageState::from_html("http://x", &html).unwrap();
        assert_eq!(state.ssrlog(), Some("line one\nline two"));
    }

    #[test]
    fn title_rules_fall_through_in_order() {
        let obj = serde_json::json!({"subTitle": "Fallback Title", "name": "  "});
        assert_eq!(
            apply_rules(&obj, TITLE_RULES).as_deref(),
            Some("Fallback Title")
        );

        let obj = serde_json::json!({"name": "Primary", "subTitle": "Secondary"});
        assert_eq!(apply_rules(&obj, TITLE_RULES).as_deref(), Some("Primary"));
    }

    #[test]
    fn durations_in_many_shapes() {
        assert_eq!(parse_duration_secs("23:00"), Some(1380));
        assert_eq!(parse_duration_secs("1:02:03"), Some(3723));
        assert_eq!(parse_duration_secs("1380"), Some(1380));
        assert_eq!(parse_duration_secs("PT23M45S"), Some(1425));
        assert_eq!(parse_duration_secs("PT1H2M3S"), Some(3723));
        assert_eq!(parse_duration_secs("garbage"), None);
        assert_eq!(parse_duration_secs("0"), None);
    }

    #[test]
    fn classification_by_title() {
        assert_eq!(classify_title("Super Cube Episode 3"), ContentKind::Episode);
        assert_eq!(
            classify_title("Episode 4 Preview"),
            ContentKind::Preview
        );
        assert_eq!(classify_title("超能立方 第5集预告"), ContentKind::Preview);
        assert_eq!(classify_title("Official Trailer"), ContentKind::Trailer);
    }

    fn playlist_page() -> String {
        wrap(
            r#"{
                "props": {
                    "initialState": {
                        "play": {
                            "cachePlayList": {
                                "1": [
                                    {"name": "Super Cube Episode 1", "albumPlayUrl": "/play/super-cube-episode-1-abc", "imgUrl": "//pic.example.com/ep1.jpg", "duration": "23:00"},
                                    {"name": "Super Cube Episode 2", "albumPlayUrl": "//www.iq.com/play/super-cube-episode-2-def"},
                                    {"name": "Super Cube Episode 2", "albumPlayUrl": "/play/super-cube-episode-2-dup"},
                                    {"name": "Episode 3 Preview", "albumPlayUrl": "/play/preview-3"}
                                ]
                            }
                        },
                        "album": {"videoAlbumInfo": {"desc": "A cube grants powers."}}
                    }
                }
            }"#,
        )
    }

    #[test]
    fn episode_list_extraction() {
        let state = PageState::from_html("http://page", &playlist_page()).unwrap();
        let ctx = SessionContext::default();
        let episodes = state.episode_list(&ctx);

        assert_eq!(episodes.len(), 3, "duplicate ordinal should be dropped");

        let ep1 = &episodes[0];
        assert_eq!(ep1.ordinal, Some(1));
        assert_eq!(ep1.url, "https://www.iq.com/play/super-cube-episode-1-abc");
        assert_eq!(ep1.thumbnail.as_deref(), Some("https://pic.example.com/ep1.jpg"));
        assert_eq!(ep1.duration_secs, Some(1380));
        assert_eq!(ep1.description.as_deref(), Some("A cube grants powers."));

        let ep2 = &episodes[1];
        assert_eq!(ep2.url, "https://www.iq.com/play/super-cube-episode-2-def");

        assert_eq!(episodes[2].kind, ContentKind::Preview);
    }

    #[tokio::test]
    async fn cache_parses_seeded_html_without_refetching() {
        let cache = PageCache::new();
        cache
            .html
            .lock()
            .await
            .insert("http://page".to_string(), Arc::new(playlist_page()));

        let client = util::HttpClient::new("test", std::time::Duration::from_secs(1)).unwrap();
        let state = cache.get_state(&client, "http://page").await.unwrap();
        assert!(state.at(PLAYLIST_PTR).is_some());

        let again = cache.get_state(&client, "http://page").await.unwrap();
        assert!(Arc::ptr_eq(&state, &again));
    }
}

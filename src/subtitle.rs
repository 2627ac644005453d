use std::fmt;

use chrono::Utc;
use regex::Regex;
use serde::{Serialize, Serializer};

use crate::{dash::DashResponse, session::SessionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleFormat {
    Srt,
    Xml,
    WebVtt,
}

impl fmt::Display for SubtitleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubtitleFormat::Srt => write!(f, "srt"),
            SubtitleFormat::Xml => write!(f, "xml"),
            SubtitleFormat::WebVtt => write!(f, "webvtt"),
        }
    }
}

impl Serialize for SubtitleFormat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtitleTrack {
    pub language: String,
    pub format: SubtitleFormat,
    pub url: String,
    pub language_code: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum SubtitleError {
    #[error("subtitle track references tvid {found}, video stream is {expected}")]
    TvidMismatch { expected: String, found: String },
}

/// Derives subtitle tracks from the same resolution response the video
/// variant came from. Taking `&DashResponse` is the whole point: the TVID is
/// read from the shared response, never re-derived, so a track cannot drift
/// onto another episode's identifier.
pub fn resolve(
    ctx: &SessionContext,
    response: &DashResponse,
) -> Result<Vec<SubtitleTrack>, SubtitleError> {
    let tracks = build_tracks(ctx, response, Utc::now().timestamp_millis());

    if let Some(tvid) = response.tvid.as_deref() {
        verify_consistency(&tracks, tvid)?;
    }

    Ok(tracks)
}

fn build_tracks(ctx: &SessionContext, response: &DashResponse, now_ms: i64) -> Vec<SubtitleTrack> {
    let Some(tvid) = response.tvid.as_deref() else {
        if !response.program.stl.is_empty() {
            warn!("subtitle tracks present but no tvid on the resolution; skipping them");
        }
        return Vec::new();
    };

    let mut tracks = Vec::new();
    for meta in &response.program.stl {
        let language = meta
            .display_name
            .clone()
            .or_else(|| meta.name.clone())
            .unwrap_or_else(|| "Unknown".to_string());
        let language_code = meta.lid.map(|l| l.to_string());

        for (format, path) in [
            (SubtitleFormat::Srt, &meta.srt),
            (SubtitleFormat::Xml, &meta.xml),
            (SubtitleFormat::WebVtt, &meta.webvtt),
        ] {
            let Some(path) = path.as_deref() else {
                continue;
            };
            let url = authenticated_url(ctx, path, tvid, language_code.as_deref(), now_ms);
            tracks.push(SubtitleTrack {
                language: language.clone(),
                format,
                url,
                language_code: language_code.clone(),
            });
        }
    }

    debug!("resolved {} subtitle tracks for tvid {}", tracks.len(), tvid);
    tracks
}

fn authenticated_url(
    ctx: &SessionContext,
    path: &str,
    tvid: &str,
    lid: Option<&str>,
    now_ms: i64,
) -> String {
    if path.starts_with("http") {
        return path.to_string();
    }
    if path.starts_with("//") {
        return format!("https:{}", path);
    }
    if path.contains('?') {
        format!(
            "{}{}&qd_tvid={}&qyid={}&qd_tm={}",
            ctx.subtitle_endpoint, path, tvid, ctx.device_id, now_ms
        )
    } else {
        format!(
            "{}{}?qd_uid=0&qd_tm={}&qd_tvid={}&qyid={}&lid={}",
            ctx.subtitle_endpoint,
            path,
            now_ms,
            tvid,
            ctx.device_id,
            lid.unwrap_or("")
        )
    }
}

/// Re-reads the content identifier out of every built URL and demands it
/// match the video's. A mismatch is a defect to surface, never something to
/// patch up silently.
pub fn verify_consistency(tracks: &[SubtitleTrack], tvid: &str) -> Result<(), SubtitleError> {
    let re = Regex::new(r"qd_tvid=(\d+)").expect("static pattern");
    for track in tracks {
        if let Some(caps) = re.captures(&track.url) {
            let found = &caps[1];
            if found != tvid {
                return Err(SubtitleError::TvidMismatch {
                    expected: tvid.to_string(),
                    found: found.to_string(),
                });
            }
        }
    }
    Ok(())
}

use serde::Deserialize;
use serde_aux::prelude::*;

use crate::{query::StreamQuery, session::SessionContext, util};

/// Upstream status code for a successful resolution.
pub const SUCCESS_CODE: &str = "A00000";
/// Upstream status code for a token whose signature has expired.
pub const EXPIRED_CODE: &str = "A00020";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    pub code: String,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<EnvelopeData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnvelopeData {
    #[serde(default)]
    pub program: Option<Program>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub video: Vec<VideoStream>,
    #[serde(default)]
    pub stl: Vec<SubtitleMeta>,
}

/// One quality variant from the resolution response. `bid` tags the
/// bitrate tier; `m3u8` carries the raw playlist text when the upstream
/// grants this tier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VideoStream {
    #[serde(default, deserialize_with = "deserialize_number_from_string")]
    pub bid: i64,
    #[serde(default)]
    pub m3u8: Option<String>,
    /// Size estimate in MB as reported upstream.
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub fs: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub duration: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubtitleMeta {
    /// Localized display name; `name` is the fallback the upstream uses on
    /// older schema revisions.
    #[serde(rename = "_name", default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub lid: Option<i64>,
    #[serde(default)]
    pub srt: Option<String>,
    #[serde(default)]
    pub xml: Option<String>,
    #[serde(default)]
    pub webvtt: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum DashError {
    #[error("could not reach resolution endpoint")]
    Download(#[from] util::DownloadError),
    #[error("could not parse resolution envelope")]
    Parse(#[from] serde_json::Error),
    #[error("resolution endpoint returned a page instead of an envelope")]
    Blocked,
    #[error("signature expired: {0}")]
    ExpiredSignature(String),
    #[error("resolution api error {code}: {msg}")]
    Api { code: String, msg: String },
    #[error("envelope carries no program data")]
    MissingProgram,
}

/// A successful resolution: the envelope's program plus the identifiers it
/// was resolved under. Video selection and subtitle resolution both read
/// from this one value, which is what keeps their content identifiers in
/// agreement.
#[derive(Debug, Clone)]
pub struct DashResponse {
    pub query: StreamQuery,
    pub tvid: Option<String>,
    pub program: Program,
}

/// One blocking read of the resolution endpoint, the token passed verbatim
/// as the query. Pure read; transient network failures are retried by the
/// client middleware, nothing else is.
pub async fn resolve(
    client: &util::HttpClient,
    ctx: &SessionContext,
    query: &StreamQuery,
) -> Result<DashResponse, DashError> {
    let url = format!("{}?{}", ctx.dash_endpoint, query.as_str());
    debug!("resolving variants for tvid {:?}", query.tvid());
    let body = client.fetch_text(&url).await?;
    parse_response(query, &body)
}

pub fn parse_response(query: &StreamQuery, body: &str) -> Result<DashResponse, DashError> {
    // A blocked or throttled client gets an HTML page back on this
    // endpoint; do not feed that to the JSON parser.
    if body.trim_start().starts_with('<') {
        return Err(DashError::Blocked);
    }

    let envelope: Envelope = serde_json::from_str(body)?;
    match envelope.code.as_str() {
        SUCCESS_CODE => {
            let program = envelope
                .data
                .and_then(|d| d.program)
                .ok_or(DashError::MissingProgram)?;
            Ok(DashResponse {
                query: query.clone(),
                tvid: query.tvid().map(|t| t.to_string()),
                program,
            })
        }
        EXPIRED_CODE => Err(DashError::ExpiredSignature(
            envelope.msg.unwrap_or_else(|| "Time expired".to_string()),
        )),
        other => Err(DashError::Api {
            code: other.to_string(),
            msg: envelope.msg.unwrap_or_else(|| "Unknown error".to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> StreamQuery {
        StreamQuery::from_raw("tvid=3672014441006600&bid=200&vid=abc")
    }

    #[test]
    fn success_envelope() {
        let body = r##"{
            "code": "A00000",
            "data": {
                "program": {
                    "video": [
                        {"bid": 200, "m3u8": "#EXTM3U\n#EXTINF:10.0,\nhttps://seg/1\n", "fs": 120},
                        {"bid": "500", "fs": 300}
                    ],
                    "stl": [
                        {"_name": "English", "lid": 1, "srt": "/sub/en.srt"}
                    ]
                }
            }
        }"##;

        let resp = parse_response(&query(), body).expect("should parse");
        assert_eq!(resp.tvid.as_deref(), Some("3672014441006600"));
        assert_eq!(resp.program.video.len(), 2);
        assert_eq!(resp.program.video[0].bid, 200);
        assert_eq!(resp.program.video[1].bid, 500, "string bid should coerce");
        assert!(resp.program.video[1].m3u8.is_none());
        assert_eq!(resp.program.stl.len(), 1);
        assert_eq!(resp.program.stl[0].display_name.as_deref(), Some("English"));
    }

    #[test]
    fn expired_signature_is_its_own_class() {
        let body = r#"{"code": "A00020", "msg": "Time expired"}"#;
        match parse_response(&query(), body) {
            Err(DashError::ExpiredSignature(msg)) => assert_eq!(msg, "Time expired"),
            other => panic!("expected ExpiredSignature, got {:?}", other.err()),
        }
    }

    #[test]
    fn other_codes_are_api_errors() {
        let body = r#"{"code": "A00001", "msg": "no permission"}"#;
        match parse_response(&query(), body) {
            Err(DashError::Api { code, msg }) => {
                assert_eq!(code, "A00001");
                assert_eq!(msg, "no permission");
            }
            other => panic!("expected Api, got {:?}", other.err()),
        }
    }

    #[test]
    fn html_body_means_blocked() {
        let body = "<!DOCTYPE html><html><body>403</body></html>";
        assert!(matches!(
            parse_response(&query(), body),
            Err(DashError::Blocked)
        ));
    }

    #[test]
    fn success_without_program_is_structural() {
        let body = r#"{"code": "A00000", "data": {}}"#;
        assert!(matches!(
            parse_response(&query(), body),
            Err(DashError::MissingProgram)
        ));
    }
}

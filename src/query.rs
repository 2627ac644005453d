use regex::Regex;

use crate::page_state::PageState;

/// Prefix the upstream's server-side render log uses for the internal
/// resolution URL. The signed query string follows it.
const SSRLOG_DASH_PREFIX: &str = r"http://intel-cache\.video\.qiyi\.domain/dash\?([^\s]+)";

/// Opaque signed resolution token with a server-enforced expiry that cannot
/// be verified locally. It is extracted whole and passed verbatim as the
/// resolution endpoint's query string; its signature cannot be legitimately
/// reproduced, so nothing here ever builds one from parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamQuery(String);

impl StreamQuery {
    /// Pulls the token out of the page state's free-text log field, or
    /// nothing if the upstream stopped logging it.
    pub fn from_page_state(state: &PageState) -> Option<Self> {
        let log = state.ssrlog()?;
        Self::from_ssrlog(log)
    }

    pub fn from_ssrlog(log: &str) -> Option<Self> {
        let re = Regex::new(SSRLOG_DASH_PREFIX).ok()?;
        let caps = re.captures(log)?;
        Some(Self(caps.get(1)?.as_str().to_string()))
    }

    /// Wraps a query string scraped or constructed outside the primary
    /// path. Degraded strategies use this; the token is still treated as
    /// opaque afterwards.
    pub fn from_raw(query: impl Into<String>) -> Self {
        Self(query.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Content identifier carried inside the token. Shared with subtitle
    /// URLs, which must reference the same one.
    pub fn tvid(&self) -> Option<&str> {
        let start = if let Some(idx) = self.0.find("tvid=") {
            idx + "tvid=".len()
        } else {
            return None;
        };
        let rest = &self.0[start..];
        let end = rest.find('&').unwrap_or(rest.len());
        let tvid = &rest[..end];
        (!tvid.is_empty() && tvid.bytes().all(|b| b.is_ascii_digit())).then_some(tvid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SSRLOG: &str = "ts=12 vrsorder dash \
        [info] requesting http://intel-cache.video.qiyi.domain/dash?tvid=3672014441006600&bid=200&vid=abe2c4&authKey=42137e8b&tm=1753933550332 200 OK\n\
        [info] render done";

    #[test]
    fn token_from_ssrlog() {
        let query = StreamQuery::from_ssrlog(SSRLOG).expect("token should be found");
        assert_eq!(
            query.as_str(),
            "tvid=3672014441006600&bid=200&vid=abe2c4&authKey=42137e8b&tm=1753933550332"
        );
    }

    #[test]
    fn no_token_in_unrelated_log() {
        assert!(StreamQuery::from_ssrlog("nothing to see here").is_none());
        assert!(StreamQuery::from_ssrlog("http://intel-cache.video.qiyi.domain/other?x=1").is_none());
    }

    #[test]
    fn tvid_parsing() {
        let query = StreamQuery::from_ssrlog(SSRLOG).unwrap();
        assert_eq!(query.tvid(), Some("3672014441006600"));

        assert_eq!(StreamQuery::from_raw("bid=200&vid=abc").tvid(), None);
        assert_eq!(StreamQuery::from_raw("tvid=&bid=200").tvid(), None);
        assert_eq!(StreamQuery::from_raw("tvid=12x4").tvid(), None);
        assert_eq!(StreamQuery::from_raw("tvid=1234").tvid(), Some("1234"));
    }
}

use std::time::Duration;

/// Immutable per-resolution context. Every stage receives a reference to
/// this instead of reading ambient globals, so two concurrent resolutions
/// can never observe each other's session state.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Device identifier sent as `qyid` on authenticated subtitle URLs.
    pub device_id: String,
    pub user_agent: String,
    /// Base of the stream resolution endpoint; the opaque token is appended
    /// verbatim as the full query string.
    pub dash_endpoint: String,
    /// Base for relative subtitle paths.
    pub subtitle_endpoint: String,
    /// Base for page URLs given as absolute paths in episode lists.
    pub site_base: String,
    pub request_timeout: Duration,
    /// Mandatory floor between successive episode resolutions.
    pub request_interval: Duration,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            device_id: "2900bedf21104d90794f96ab02572e03".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36"
                .to_string(),
            dash_endpoint: "https://cache.video.iqiyi.com/dash".to_string(),
            subtitle_endpoint: "http://meta.video.iqiyi.com".to_string(),
            site_base: "https://www.iq.com".to_string(),
            request_timeout: Duration::from_secs(30),
            request_interval: Duration::from_secs(1),
        }
    }
}

impl SessionContext {
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn with_request_interval(mut self, interval: Duration) -> Self {
        self.request_interval = interval;
        self
    }
}

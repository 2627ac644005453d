use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde::Serialize;

use crate::{
    dash::{self, DashError, DashResponse},
    page_state::{self, ContentKind, EpisodeDescriptor, PageCache, PageStateError},
    playlist::{self, PlaylistStats},
    quality::{self, QualityTier},
    query::StreamQuery,
    session::SessionContext,
    subtitle::{self, SubtitleError, SubtitleTrack},
    util::{self, HttpClient, RateGovernor},
};

/// Exposed resolution URLs occasionally leak into the page itself; the
/// page-scan strategy picks them up verbatim.
const PAGE_DASH_PATTERN: &str = r#"https://cache\.video\.iqiyi\.com/dash\?([^"'\s\\]+)"#;

/// Known query templates for the last-resort probe. No legitimate signature
/// can be synthesized locally, so these only ever work when the upstream
/// happens not to enforce one; results are labeled low-confidence.
const PROBE_TEMPLATES: &[&str] = &[
    "tvid={id}&bid=200&vid={id}",
    "tvid={id}&vid={id}&src=01010031010000000000",
    "tvid={id}&bid=500&vid={id}&src=01010031010000000000&vf=bd",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Parse,
    ExpiredSignature,
    ApiError,
    NoQualityFound,
    TvidMismatch,
}

/// Remediation hint for the catalog boundary, derived from the error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Remediation {
    RetryLater,
    RefreshSource,
    Unsupported,
}

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("page state: {0}")]
    PageState(#[from] PageStateError),
    #[error("no resolution token found in page state")]
    MissingQuery,
    #[error("stream resolution: {0}")]
    Dash(#[from] DashError),
    #[error("quality selection: {0}")]
    Quality(#[from] quality::QualityError),
    #[error("subtitles: {0}")]
    Subtitle(#[from] SubtitleError),
    #[error("all strategies exhausted: {last}")]
    Exhausted { last: Box<ExtractError> },
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::PageState(PageStateError::Download(_)) => ErrorKind::Network,
            ExtractError::PageState(_) => ErrorKind::Parse,
            ExtractError::MissingQuery => ErrorKind::Parse,
            ExtractError::Dash(DashError::Download(_)) => ErrorKind::Network,
            ExtractError::Dash(DashError::Parse(_)) | ExtractError::Dash(DashError::MissingProgram) => {
                ErrorKind::Parse
            }
            ExtractError::Dash(DashError::ExpiredSignature(_)) => ErrorKind::ExpiredSignature,
            ExtractError::Dash(DashError::Blocked) | ExtractError::Dash(DashError::Api { .. }) => {
                ErrorKind::ApiError
            }
            ExtractError::Quality(_) => ErrorKind::NoQualityFound,
            ExtractError::Subtitle(_) => ErrorKind::TvidMismatch,
            ExtractError::Exhausted { last } => last.kind(),
        }
    }

    pub fn remediation(&self) -> Remediation {
        match self.kind() {
            ErrorKind::Network | ErrorKind::ApiError => Remediation::RetryLater,
            ErrorKind::ExpiredSignature | ErrorKind::Parse => Remediation::RefreshSource,
            ErrorKind::NoQualityFound | ErrorKind::TvidMismatch => Remediation::Unsupported,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Normal,
    Low,
}

/// The selected variant plus everything the catalog stores about it.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedStream {
    pub tvid: Option<String>,
    pub bid: i64,
    pub tier: QualityTier,
    pub url: String,
    pub playlist: String,
    pub stats: PlaylistStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct Extraction {
    pub descriptor: EpisodeDescriptor,
    pub stream: Option<ResolvedStream>,
    pub subtitles: Vec<SubtitleTrack>,
    pub strategy: &'static str,
    pub confidence: Confidence,
}

/// Everything a strategy may touch, borrowed per resolution. No ambient
/// state: two concurrent resolutions share only the page cache and the rate
/// governor, both by design.
pub struct PipelineEnv<'a> {
    pub client: &'a HttpClient,
    pub ctx: &'a SessionContext,
    pub cache: &'a PageCache,
    pub governor: &'a RateGovernor,
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, env: &PipelineEnv<'_>, url: &str) -> Result<Extraction, ExtractError>;
}

/// Shared tail of every token-bearing strategy: select the best variant,
/// analyze its playlist, and derive subtitles from the same response.
pub fn resolve_from_response(
    ctx: &SessionContext,
    response: &DashResponse,
) -> Result<(ResolvedStream, Vec<SubtitleTrack>), ExtractError> {
    let best = quality::select_best(&response.program.video)?;
    let playlist_text = best.m3u8.as_deref().unwrap_or_default();
    let stats = playlist::analyze(playlist_text);
    let subtitles = subtitle::resolve(ctx, response)?;

    let stream = ResolvedStream {
        tvid: response.tvid.clone(),
        bid: best.bid,
        tier: QualityTier::for_bid(best.bid),
        url: format!(
            "{}?{}&bid={}",
            ctx.dash_endpoint,
            response.query.as_str(),
            best.bid
        ),
        playlist: playlist_text.to_string(),
        stats,
    };
    Ok((stream, subtitles))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Minimal descriptor for strategies that cannot read one off the page.
fn descriptor_from_url(url: &str) -> EpisodeDescriptor {
    let slug = url
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .split('?')
        .next()
        .unwrap_or_default();

    let mut words: Vec<&str> = slug.split('-').filter(|w| !w.is_empty()).collect();
    // The trailing token is usually the opaque page id, not a title word.
    if words.len() > 1 {
        let last = words[words.len() - 1];
        let mixed = last.len() >= 6
            && last.chars().any(|c| c.is_ascii_digit())
            && last.chars().any(|c| c.is_ascii_alphabetic());
        if mixed {
            words.pop();
        }
    }

    let title = if words.is_empty() {
        "Unknown Episode".to_string()
    } else {
        words
            .iter()
            .map(|w| capitalize(w))
            .collect::<Vec<_>>()
            .join(" ")
    };

    EpisodeDescriptor {
        ordinal: page_state::ordinal_from_title(&title),
        title,
        url: url.to_string(),
        kind: ContentKind::Episode,
        description: None,
        thumbnail: None,
        duration_secs: None,
        is_valid: false,
    }
}

fn episode_id_from_url(url: &str) -> Option<String> {
    let re = Regex::new(r"/play/[^/?]*-([a-zA-Z0-9]+)(?:[?#]|$)").ok()?;
    Some(re.captures(url)?.get(1)?.as_str().to_string())
}

async fn descriptor_from_page(env: &PipelineEnv<'_>, url: &str) -> EpisodeDescriptor {
    match env.cache.get_state(env.client, url).await {
        Ok(state) => state.current_episode().unwrap_or_else(|| descriptor_from_url(url)),
        Err(_) => descriptor_from_url(url),
    }
}

/// Primary path: embedded state, signed token, resolution call.
struct StateStrategy;

#[async_trait]
impl Strategy for StateStrategy {
    fn name(&self) -> &'static str {
        "state"
    }

    async fn run(&self, env: &PipelineEnv<'_>, url: &str) -> Result<Extraction, ExtractError> {
        let state = env.cache.get_state(env.client, url).await?;
        let query = StreamQuery::from_page_state(&state).ok_or(ExtractError::MissingQuery)?;
        let response = dash::resolve(env.client, env.ctx, &query).await?;
        let (stream, subtitles) = resolve_from_response(env.ctx, &response)?;

        let mut descriptor = state
            .current_episode()
            .unwrap_or_else(|| descriptor_from_url(url));
        descriptor.is_valid = true;

        Ok(Extraction {
            descriptor,
            stream: Some(stream),
            subtitles,
            strategy: "",
            confidence: Confidence::Normal,
        })
    }
}

/// Scrapes the raw page text for an exposed resolution URL. Works when the
/// state block moved or broke but the page still leaks the endpoint.
struct PageScanStrategy;

#[async_trait]
impl Strategy for PageScanStrategy {
    fn name(&self) -> &'static str {
        "page-scan"
    }

    async fn run(&self, env: &PipelineEnv<'_>, url: &str) -> Result<Extraction, ExtractError> {
        let html = env.cache.get_html(env.client, url).await?;
        let re = Regex::new(PAGE_DASH_PATTERN).expect("static pattern");
        let query = re
            .captures(&html)
            .and_then(|caps| caps.get(1))
            .map(|m| StreamQuery::from_raw(m.as_str()))
            .ok_or(ExtractError::MissingQuery)?;

        let response = dash::resolve(env.client, env.ctx, &query).await?;
        let (stream, subtitles) = resolve_from_response(env.ctx, &response)?;

        let mut descriptor = descriptor_from_page(env, url).await;
        descriptor.is_valid = true;

        Ok(Extraction {
            descriptor,
            stream: Some(stream),
            subtitles,
            strategy: "",
            confidence: Confidence::Normal,
        })
    }
}

/// Last-resort probe of known query templates built from the episode id.
/// Unsigned, so the upstream usually rejects it; anything it does return is
/// labeled low-confidence.
struct TemplateProbeStrategy;

#[async_trait]
impl Strategy for TemplateProbeStrategy {
    fn name(&self) -> &'static str {
        "template-probe"
    }

    async fn run(&self, env: &PipelineEnv<'_>, url: &str) -> Result<Extraction, ExtractError> {
        let id = episode_id_from_url(url).ok_or(ExtractError::MissingQuery)?;
        warn!("probing constructed queries for episode id {}; results are low-confidence", id);

        let mut last: Option<ExtractError> = None;
        for template in PROBE_TEMPLATES {
            env.governor.pace().await;
            let query = StreamQuery::from_raw(template.replace("{id}", &id));
            match dash::resolve(env.client, env.ctx, &query).await {
                Ok(response) => {
                    let (stream, subtitles) = resolve_from_response(env.ctx, &response)?;
                    let mut descriptor = descriptor_from_page(env, url).await;
                    descriptor.is_valid = true;
                    return Ok(Extraction {
                        descriptor,
                        stream: Some(stream),
                        subtitles,
                        strategy: "",
                        confidence: Confidence::Low,
                    });
                }
                Err(e) => {
                    let e = ExtractError::from(e);
                    if e.kind() == ErrorKind::Network {
                        return Err(e);
                    }
                    debug!("probe template rejected: {}", e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(ExtractError::MissingQuery))
    }
}

/// Metadata-only harvesting: descriptors without stream resolution, so the
/// catalog can at least list what exists.
struct HarvestStrategy;

#[async_trait]
impl Strategy for HarvestStrategy {
    fn name(&self) -> &'static str {
        "harvest"
    }

    async fn run(&self, env: &PipelineEnv<'_>, url: &str) -> Result<Extraction, ExtractError> {
        let descriptor = match env.cache.get_state(env.client, url).await {
            Ok(state) => state
                .current_episode()
                .unwrap_or_else(|| descriptor_from_url(url)),
            Err(PageStateError::Download(e)) => {
                return Err(ExtractError::PageState(PageStateError::Download(e)))
            }
            Err(_) => descriptor_from_url(url),
        };

        Ok(Extraction {
            descriptor,
            stream: None,
            subtitles: Vec::new(),
            strategy: "",
            confidence: Confidence::Normal,
        })
    }
}

fn default_strategies() -> Vec<Box<dyn Strategy>> {
    vec![
        Box::new(StateStrategy),
        Box::new(PageScanStrategy),
        Box::new(TemplateProbeStrategy),
        Box::new(HarvestStrategy),
    ]
}

/// Walks the strategy list in order. Advancing happens only on classified,
/// non-retryable failures; a network failure already went through the
/// client's bounded backoff, and no other strategy would fare better on a
/// dead network, so it aborts the chain instead.
pub async fn run_strategies(
    env: &PipelineEnv<'_>,
    strategies: &[Box<dyn Strategy>],
    url: &str,
) -> Result<Extraction, ExtractError> {
    let mut last: Option<ExtractError> = None;

    for strategy in strategies {
        debug!("running strategy {} for {}", strategy.name(), url);
        match strategy.run(env, url).await {
            Ok(mut extraction) => {
                extraction.strategy = strategy.name();
                info!("strategy {} resolved {}", strategy.name(), url);
                return Ok(extraction);
            }
            Err(e) if e.kind() == ErrorKind::Network => {
                warn!("network failure in strategy {}: {}", strategy.name(), e);
                return Err(e);
            }
            Err(e) => {
                warn!("strategy {} failed: {}; advancing", strategy.name(), e);
                last = Some(e);
            }
        }
    }

    Err(ExtractError::Exhausted {
        last: Box::new(last.unwrap_or(ExtractError::MissingQuery)),
    })
}

/// Catalog-facing result. Carries a success flag, a human-readable reason,
/// and a remediation category; internal diagnostics stay inside the crate.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub success: bool,
    pub url: String,
    pub strategy: Option<String>,
    pub confidence: Option<Confidence>,
    pub reason: String,
    pub remediation: Option<Remediation>,
    pub episode: Option<EpisodeDescriptor>,
    pub stream: Option<ResolvedStream>,
    pub subtitles: Vec<SubtitleTrack>,
}

impl ExtractionReport {
    pub fn from_result(url: &str, result: Result<Extraction, ExtractError>) -> Self {
        match result {
            Ok(extraction) => {
                let reason = match &extraction.stream {
                    Some(stream) => format!(
                        "resolved {} ({} segments, ~{}) via {} strategy",
                        stream.tier,
                        stream.stats.segment_count,
                        util::format_bytes(stream.stats.estimated_bytes),
                        extraction.strategy
                    ),
                    None => format!("metadata only via {} strategy", extraction.strategy),
                };
                Self {
                    success: true,
                    url: url.to_string(),
                    strategy: Some(extraction.strategy.to_string()),
                    confidence: Some(extraction.confidence),
                    reason,
                    remediation: None,
                    episode: Some(extraction.descriptor),
                    stream: extraction.stream,
                    subtitles: extraction.subtitles,
                }
            }
            Err(e) => Self {
                success: false,
                url: url.to_string(),
                strategy: None,
                confidence: None,
                reason: e.to_string(),
                remediation: Some(e.remediation()),
                episode: None,
                stream: None,
                subtitles: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistExtraction {
    /// Everything listed on the page, previews and trailers included.
    pub descriptors: Vec<EpisodeDescriptor>,
    /// Per-episode resolution outcomes, episodes only.
    pub episodes: Vec<ExtractionReport>,
}

/// Owns the per-run machinery: one client, one page cache, one governor,
/// the ordered strategy list.
pub struct Extractor {
    ctx: SessionContext,
    client: HttpClient,
    cache: PageCache,
    governor: RateGovernor,
    strategies: Vec<Box<dyn Strategy>>,
}

impl Extractor {
    pub fn new(ctx: SessionContext) -> reqwest::Result<Self> {
        let client = HttpClient::new(&ctx.user_agent, ctx.request_timeout)?;
        let governor = RateGovernor::new(ctx.request_interval);
        Ok(Self {
            client,
            cache: PageCache::new(),
            governor,
            strategies: default_strategies(),
            ctx,
        })
    }

    fn env(&self) -> PipelineEnv<'_> {
        PipelineEnv {
            client: &self.client,
            ctx: &self.ctx,
            cache: &self.cache,
            governor: &self.governor,
        }
    }

    /// Resolves one episode page. The whole per-episode chain either fully
    /// resolves or fully fails; nothing partial is surfaced.
    pub async fn extract_episode(&self, url: &str) -> Result<Extraction, ExtractError> {
        self.governor.pace().await;
        run_strategies(&self.env(), &self.strategies, url).await
    }

    pub async fn extract_report(&self, url: &str) -> ExtractionReport {
        ExtractionReport::from_result(url, self.extract_episode(url).await)
    }

    /// Resolves every episode listed on an album page. Parallelism applies
    /// only across episodes, never within one episode's chain, and the rate
    /// governor keeps the aggregate request rate under the ceiling.
    pub async fn extract_playlist(
        &self,
        url: &str,
        concurrency: usize,
    ) -> Result<PlaylistExtraction, ExtractError> {
        self.governor.pace().await;
        let state = self.cache.get_state(&self.client, url).await?;
        let descriptors = state.episode_list(&self.ctx);

        let targets: Vec<EpisodeDescriptor> = descriptors
            .iter()
            .filter(|e| e.kind == ContentKind::Episode)
            .cloned()
            .collect();
        info!(
            "resolving {} of {} listed items",
            targets.len(),
            descriptors.len()
        );

        let episodes = tokio_stream::iter(targets)
            .map(|listed| async move {
                self.governor.pace().await;
                let result = run_strategies(&self.env(), &self.strategies, &listed.url).await;
                let mut report = ExtractionReport::from_result(&listed.url, result);
                merge_listed_metadata(&mut report, listed);
                report
            })
            .buffered(concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        Ok(PlaylistExtraction {
            descriptors,
            episodes,
        })
    }
}

/// The album listing often knows more about an episode than its own page
/// does; fill the gaps without overriding what the page said.
fn merge_listed_metadata(report: &mut ExtractionReport, listed: EpisodeDescriptor) {
    match report.episode.as_mut() {
        None => report.episode = Some(listed),
        Some(ep) => {
            if ep.ordinal.is_none() {
                ep.ordinal = listed.ordinal;
            }
            if ep.description.is_none() {
                ep.description = listed.description;
            }
            if ep.thumbnail.is_none() {
                ep.thumbnail = listed.thumbnail;
            }
            if ep.duration_secs.is_none() {
                ep.duration_secs = listed.duration_secs;
            }
        }
    }
}

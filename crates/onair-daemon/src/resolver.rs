//! Track duration resolution and platform search.
//!
//! Every approved request gets its playback duration from the source
//! platform before it is scheduled: YouTube through the Data API's
//! `contentDetails` duration, RuTube by summing the segment durations of
//! the stream's HLS media playlist.  Lookups are bounded by a timeout and
//! every failure degrades to a fixed fallback duration, so a broken or slow
//! metadata source can never wedge moderation.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use onair_proto::config::ResolverConfig;
use onair_proto::model::Platform;

const RUTUBE_ORIGIN: &str = "https://rutube.ru";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/96.0.4664.110 Safari/537.36";

/// Per-platform duration lookup.  Implementations may fail; the resolver
/// turns any failure into the fallback duration.
#[async_trait]
pub trait DurationLookup: Send + Sync {
    async fn resolve(&self, track: &str) -> anyhow::Result<u32>;
}

// ── YouTube ───────────────────────────────────────────────────────────────

pub struct YoutubeLookup {
    client: Client,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideosResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    #[serde(rename = "contentDetails")]
    content_details: ContentDetails,
}

#[derive(Debug, Deserialize)]
struct ContentDetails {
    duration: String,
}

impl YoutubeLookup {
    pub fn new(client: Client, api_key: Option<String>) -> Self {
        Self { client, api_key }
    }

    fn api_key(&self) -> anyhow::Result<String> {
        std::env::var("YOUTUBE_API_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .or_else(|| self.api_key.clone())
            .context("no YouTube API key configured")
    }
}

#[async_trait]
impl DurationLookup for YoutubeLookup {
    async fn resolve(&self, track: &str) -> anyhow::Result<u32> {
        let video_id = youtube_video_id(track)
            .with_context(|| format!("no video id in locator {}", track))?;
        let key = self.api_key()?;

        let response = self
            .client
            .get("https://www.googleapis.com/youtube/v3/videos")
            .query(&[
                ("key", key.as_str()),
                ("id", video_id.as_str()),
                ("part", "contentDetails"),
            ])
            .send()
            .await
            .context("failed to reach YouTube API")?;

        if !response.status().is_success() {
            anyhow::bail!("YouTube API returned status: {}", response.status());
        }

        let data: VideosResponse = response
            .json()
            .await
            .context("failed to parse YouTube API response")?;
        let iso = &data
            .items
            .first()
            .with_context(|| format!("video {} not found", video_id))?
            .content_details
            .duration;

        let secs = parse_iso8601_duration(iso)
            .with_context(|| format!("unparsable duration {:?}", iso))?;
        anyhow::ensure!(secs > 0, "video {} reports zero duration", video_id);
        Ok(secs)
    }
}

// ── RuTube ────────────────────────────────────────────────────────────────

pub struct RutubeLookup {
    client: Client,
}

#[derive(Debug, Deserialize)]
struct PlayOptions {
    video_balancer: Option<VideoBalancer>,
}

#[derive(Debug, Deserialize)]
struct VideoBalancer {
    m3u8: Option<String>,
}

impl RutubeLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fetch_text(&self, url: &str, video_id: &str) -> anyhow::Result<String> {
        let response = self
            .client
            .get(url)
            .header("Referer", format!("{}/video/{}/", RUTUBE_ORIGIN, video_id))
            .header("Origin", RUTUBE_ORIGIN)
            .send()
            .await
            .with_context(|| format!("failed to fetch {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("{} returned status: {}", url, response.status());
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl DurationLookup for RutubeLookup {
    async fn resolve(&self, track: &str) -> anyhow::Result<u32> {
        let video_id = rutube_video_id(track);
        let options_url = format!("{}/api/play/options/{}/", RUTUBE_ORIGIN, video_id);

        let response = self
            .client
            .get(&options_url)
            .header("Referer", format!("{}/video/{}/", RUTUBE_ORIGIN, video_id))
            .header("Origin", RUTUBE_ORIGIN)
            .send()
            .await
            .context("failed to reach RuTube play options")?;

        if !response.status().is_success() {
            anyhow::bail!("RuTube API returned status: {}", response.status());
        }

        let options: PlayOptions = response
            .json()
            .await
            .context("failed to parse RuTube play options")?;
        let master_url = options
            .video_balancer
            .and_then(|balancer| balancer.m3u8)
            .with_context(|| format!("no stream manifest for video {}", video_id))?;

        let master = self.fetch_text(&master_url, &video_id).await?;
        let variant = first_variant_uri(&master)
            .with_context(|| format!("empty master playlist for video {}", video_id))?;
        let variant_url = reqwest::Url::parse(&master_url)
            .and_then(|base| base.join(variant))
            .context("unresolvable variant URI")?;

        let media = self.fetch_text(variant_url.as_str(), &video_id).await?;
        let total = sum_segment_durations(&media)
            .with_context(|| format!("no segments in media playlist for video {}", video_id))?;
        anyhow::ensure!(total > 0.0, "video {} sums to zero duration", video_id);

        Ok(total.round() as u32)
    }
}

// ── Locator parsing ───────────────────────────────────────────────────────

/// Extract the video id from a YouTube locator: a `v=` query parameter or a
/// `youtu.be/<id>` short link.
fn youtube_video_id(track: &str) -> Option<String> {
    let url = reqwest::Url::parse(track).ok()?;

    if let Some((_, id)) = url.query_pairs().find(|(key, _)| key == "v") {
        if !id.is_empty() {
            return Some(id.into_owned());
        }
    }

    if url.host_str() == Some("youtu.be") {
        let id = url.path().trim_matches('/');
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }

    None
}

/// RuTube locators are either the bare video id or a
/// `rutube.ru/video/<id>/` URL.
fn rutube_video_id(track: &str) -> String {
    track
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(track)
        .to_string()
}

/// Parse an ISO-8601 duration of the `PT#H#M#S` shape into whole seconds.
fn parse_iso8601_duration(value: &str) -> Option<u32> {
    let rest = value.strip_prefix("PT")?;
    if rest.is_empty() {
        return None;
    }

    let mut total: u32 = 0;
    let mut digits = String::new();
    for c in rest.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let number: u32 = digits.parse().ok()?;
        digits.clear();
        let factor = match c {
            'H' => 3600,
            'M' => 60,
            'S' => 1,
            _ => return None,
        };
        total = total.checked_add(number.checked_mul(factor)?)?;
    }

    digits.is_empty().then_some(total)
}

/// First variant URI of an HLS master playlist.
fn first_variant_uri(playlist: &str) -> Option<&str> {
    playlist
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Sum the `#EXTINF:` durations of an HLS media playlist.  `None` when the
/// manifest has no segments at all.
fn sum_segment_durations(playlist: &str) -> Option<f64> {
    let mut total = 0.0;
    let mut segments = 0usize;

    for line in playlist.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let duration = rest.split(',').next().unwrap_or(rest).trim();
            if let Ok(value) = duration.parse::<f64>() {
                total += value;
                segments += 1;
            }
        }
    }

    (segments > 0).then_some(total)
}

// ── Resolver ──────────────────────────────────────────────────────────────

pub struct DurationResolver {
    youtube: Box<dyn DurationLookup>,
    rutube: Box<dyn DurationLookup>,
    fallback_secs: u32,
    timeout: Duration,
}

impl DurationResolver {
    pub fn new(config: &ResolverConfig) -> Self {
        let client = http_client(config);
        Self {
            youtube: Box::new(YoutubeLookup::new(
                client.clone(),
                config.youtube_api_key.clone(),
            )),
            rutube: Box::new(RutubeLookup::new(client)),
            fallback_secs: config.fallback_secs.max(1),
            timeout: Duration::from_millis(config.lookup_timeout_ms),
        }
    }

    /// Wire arbitrary lookups in, for tests.
    pub fn with_lookups(
        youtube: Box<dyn DurationLookup>,
        rutube: Box<dyn DurationLookup>,
        fallback_secs: u32,
    ) -> Self {
        Self {
            youtube,
            rutube,
            fallback_secs: fallback_secs.max(1),
            timeout: Duration::from_secs(5),
        }
    }

    /// Resolve a track's duration.  Infallible by contract: lookup errors,
    /// timeouts and nonsense values all degrade to the fallback.
    pub async fn resolve(&self, platform: Platform, track: &str) -> u32 {
        let lookup = match platform {
            Platform::Youtube => &self.youtube,
            Platform::Rutube => &self.rutube,
        };

        match tokio::time::timeout(self.timeout, lookup.resolve(track)).await {
            Ok(Ok(secs)) if secs > 0 => {
                debug!(%platform, track, secs, "Resolved track duration");
                secs
            }
            Ok(Ok(_)) => {
                warn!(%platform, track, "Lookup returned zero duration, using fallback");
                self.fallback_secs
            }
            Ok(Err(e)) => {
                warn!(%platform, track, "Duration lookup failed, using fallback: {:#}", e);
                self.fallback_secs
            }
            Err(_) => {
                warn!(%platform, track, "Duration lookup timed out, using fallback");
                self.fallback_secs
            }
        }
    }
}

fn http_client(config: &ResolverConfig) -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_millis(config.lookup_timeout_ms))
        .build()
        .expect("failed to build reqwest client for resolver")
}

// ── Search ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
}

/// First-hit track search per platform, backing the HTTP search endpoints.
pub struct SearchService {
    client: Client,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YoutubeSearchResponse {
    #[serde(default)]
    items: Vec<YoutubeSearchItem>,
}

#[derive(Debug, Deserialize)]
struct YoutubeSearchItem {
    id: YoutubeSearchId,
    snippet: YoutubeSnippet,
}

#[derive(Debug, Deserialize)]
struct YoutubeSearchId {
    #[serde(rename = "videoId")]
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct YoutubeSnippet {
    title: String,
}

#[derive(Debug, Deserialize)]
struct RutubeSearchResponse {
    #[serde(default)]
    results: Vec<RutubeSearchResult>,
}

#[derive(Debug, Deserialize)]
struct RutubeSearchResult {
    id: serde_json::Value,
    title: String,
}

impl SearchService {
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            client: http_client(config),
            api_key: config.youtube_api_key.clone(),
        }
    }

    pub async fn youtube(&self, query: &str) -> anyhow::Result<SearchHit> {
        let key = std::env::var("YOUTUBE_API_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .or_else(|| self.api_key.clone())
            .context("no YouTube API key configured")?;

        let response = self
            .client
            .get("https://www.googleapis.com/youtube/v3/search")
            .query(&[
                ("key", key.as_str()),
                ("q", query),
                ("part", "snippet"),
                ("type", "video"),
                ("maxResults", "1"),
            ])
            .send()
            .await
            .context("failed to reach YouTube search")?;

        if !response.status().is_success() {
            anyhow::bail!("YouTube search returned status: {}", response.status());
        }

        let data: YoutubeSearchResponse = response.json().await?;
        let item = data.items.into_iter().next().context("no video found")?;
        Ok(SearchHit {
            url: format!("https://www.youtube.com/watch?v={}", item.id.video_id),
            title: item.snippet.title,
        })
    }

    pub async fn rutube(&self, query: &str) -> anyhow::Result<SearchHit> {
        let response = self
            .client
            .get(format!("{}/api/search/video/", RUTUBE_ORIGIN))
            .query(&[("query", query), ("limit", "1")])
            .send()
            .await
            .context("failed to reach RuTube search")?;

        if !response.status().is_success() {
            anyhow::bail!("RuTube search returned status: {}", response.status());
        }

        let data: RutubeSearchResponse = response.json().await?;
        let result = data.results.into_iter().next().context("no video found")?;
        let id = match result.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(SearchHit {
            url: id,
            title: result.title,
        })
    }
}

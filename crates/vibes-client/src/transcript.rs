use std::time::Duration;

use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use url::Url;
use vibes_core::error::AppError;
use vibes_core::traits::TranscriptFetcher;

use crate::transport_error;

const DEFAULT_BASE_URL: &str = "https://www.youtube.com";
const DEFAULT_LANGUAGE: &str = "en";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CAPTION_TRACKS_MARKER: &str = "\"captionTracks\":";

/// Fetches video transcripts from the caption tracks a watch page exposes.
///
/// Unmetered: neither request counts against the Data API quota.
#[derive(Clone)]
pub struct YouTubeTranscripts {
    client: Client,
    base_url: String,
    language: String,
    timeout_secs: u64,
}

impl YouTubeTranscripts {
    pub fn new() -> Result<Self, AppError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, AppError> {
        Self::build(base_url, DEFAULT_LANGUAGE, DEFAULT_TIMEOUT)
    }

    /// Preferred caption language (e.g. "en", "it").
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(&self.base_url, &self.language, timeout)
    }

    fn build(base_url: &str, language: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("vibes/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            language: language.to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }

    fn watch_url(&self, video_id: &str) -> Result<Url, AppError> {
        let mut url = Url::parse(&format!("{}/watch", self.base_url))
            .map_err(|e| AppError::ConfigError(format!("Invalid transcript base URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("v", video_id)
            .append_pair("hl", &self.language);
        Ok(url)
    }

    async fn get_text(&self, url: Url, video_id: &str) -> Result<String, AppError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout_secs))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::TransientCall(format!("Failed to read response body: {e}")))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), video_id));
        }
        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptionTrack {
    base_url: String,
    language_code: String,
    /// "asr" for auto-generated captions.
    #[serde(default)]
    kind: Option<String>,
}

impl CaptionTrack {
    fn is_generated(&self) -> bool {
        self.kind.as_deref() == Some("asr")
    }
}

/// Caption tracks listed in a watch page. A page without the marker has no
/// captions at all.
fn caption_tracks(page: &str) -> Result<Vec<CaptionTrack>, AppError> {
    let Some(start) = page.find(CAPTION_TRACKS_MARKER) else {
        return Ok(Vec::new());
    };
    let rest = &page[start + CAPTION_TRACKS_MARKER.len()..];
    let tracks = serde_json::Deserializer::from_str(rest)
        .into_iter::<Vec<CaptionTrack>>()
        .next()
        .transpose()?;
    Ok(tracks.unwrap_or_default())
}

/// Manual captions in `language`, then generated ones, then whatever is
/// listed first.
fn pick_track<'a>(tracks: &'a [CaptionTrack], language: &str) -> Option<&'a CaptionTrack> {
    tracks
        .iter()
        .find(|t| t.language_code == language && !t.is_generated())
        .or_else(|| tracks.iter().find(|t| t.language_code == language))
        .or_else(|| tracks.first())
}

/// Join the `<text>` segments of a timedtext document into one string.
fn parse_transcript(document: &str) -> Result<String, AppError> {
    let selector = Selector::parse("text")
        .map_err(|e| AppError::Generic(format!("Invalid transcript selector: {e}")))?;
    let html = Html::parse_fragment(document);

    let mut words = Vec::new();
    for segment in html.select(&selector) {
        let mut text: String = segment.text().collect();
        // Segment bodies arrive escaped twice ("&amp;#39;").
        if text.contains('&') {
            text = Html::parse_fragment(&text).root_element().text().collect();
        }
        words.extend(text.split_whitespace().map(str::to_string));
    }
    Ok(words.join(" "))
}

fn classify_status(status_code: u16, video_id: &str) -> AppError {
    match status_code {
        404 | 410 => AppError::permanent(format!("video {video_id} is unavailable")),
        429 => AppError::RateLimitExceeded,
        _ => AppError::ServiceError {
            message: format!("Transcript request for {video_id} failed with HTTP {status_code}"),
            status_code,
            retryable: status_code >= 500,
        },
    }
}

impl TranscriptFetcher for YouTubeTranscripts {
    async fn fetch_transcript(&self, video_id: &str) -> Result<String, AppError> {
        let page = self.get_text(self.watch_url(video_id)?, video_id).await?;
        let tracks = caption_tracks(&page)?;
        let Some(track) = pick_track(&tracks, &self.language) else {
            return Err(AppError::permanent(format!(
                "no transcript available for {video_id}"
            )));
        };

        let track_url = Url::parse(&self.base_url)
            .and_then(|base| base.join(&track.base_url))
            .map_err(|e| AppError::TransientCall(format!("Invalid caption track URL: {e}")))?;
        tracing::debug!(video = %video_id, language = %track.language_code, generated = track.is_generated(), "Fetching transcript");

        let document = self.get_text(track_url, video_id).await?;
        let transcript = parse_transcript(&document)?;
        if transcript.is_empty() {
            return Err(AppError::permanent(format!(
                "empty transcript for {video_id}"
            )));
        }
        tracing::debug!(video = %video_id, chars = transcript.len(), "Transcript fetched");
        Ok(transcript)
    }
}

//! Keyword search against the remote track index.
//!
//! Wire contract: `GET <endpoint>?word=<keywords>&choose=1&quality=<n>` answering
//! `{"code": 200, "data": {"song": …, "singer": …, "url": …}}`, or a non-200 `code` with a
//! `message` on error.

use serde::Deserialize;

use crate::config::ResolverSettings;
use crate::error::ResolveError;
use jukebox_types::TrackMetadata;

/// Looks up a playable track for free-text keywords. No retries.
pub trait Resolver: Send + Sync {
    /// `Ok(None)` means the index has no match, which is distinct from a failed lookup.
    fn resolve(&self, keywords: &str) -> Result<Option<TrackMetadata>, ResolveError>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    message: Option<String>,
    data: Option<SongData>,
}

#[derive(Debug, Deserialize)]
struct SongData {
    song: Option<String>,
    singer: Option<String>,
    url: Option<String>,
}

/// [`Resolver`] for the vkeys NetEase search API.
pub struct HttpResolver {
    agent: ureq::Agent,
    endpoint: String,
    quality: u32,
}

impl HttpResolver {
    pub fn new(settings: &ResolverSettings) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_connect(Some(settings.connect_timeout))
            .timeout_recv_response(Some(settings.read_timeout))
            .timeout_recv_body(Some(settings.read_timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            endpoint: settings.endpoint.clone(),
            quality: settings.quality,
        }
    }

    fn request_url(&self, keywords: &str) -> String {
        format!(
            "{}?word={}&choose=1&quality={}",
            self.endpoint,
            urlencoding::encode(keywords),
            self.quality
        )
    }
}

impl Resolver for HttpResolver {
    fn resolve(&self, keywords: &str) -> Result<Option<TrackMetadata>, ResolveError> {
        let url = self.request_url(keywords);
        tracing::debug!(url = %url, "search request");
        let resp = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| ResolveError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(ResolveError::HttpStatus(status));
        }
        let body = resp
            .into_body()
            .read_to_string()
            .map_err(|e| ResolveError::Transport(format!("read body: {e}")))?;
        let found = parse_envelope(&body)?;
        match &found {
            Some(meta) => tracing::info!(
                keywords = %keywords,
                title = meta.title.as_deref().unwrap_or(""),
                artist = meta.artist.as_deref().unwrap_or(""),
                "search resolved"
            ),
            None => tracing::info!(keywords = %keywords, "search found nothing"),
        }
        Ok(found)
    }
}

/// Decode the JSON envelope into a track, "no match", or a remote error.
fn parse_envelope(body: &str) -> Result<Option<TrackMetadata>, ResolveError> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| ResolveError::Malformed(e.to_string()))?;
    if envelope.code != 200 {
        let message = envelope
            .message
            .unwrap_or_else(|| format!("code {}", envelope.code));
        return Err(ResolveError::Remote(message));
    }
    let Some(data) = envelope.data else {
        return Ok(None);
    };
    let Some(url) = data.url.filter(|u| !u.trim().is_empty()) else {
        return Ok(None);
    };
    Ok(Some(TrackMetadata {
        title: data.song,
        artist: data.singer,
        source_url: url,
    }))
}

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{AssemblyError, Result};
use crate::fetch::{RemoteSource, RetryAction, RetryPolicy, retry_with_backoff};
use crate::playlist::{ParsedPlaylist, PlaylistResolver, Rendition, Segment, Selection};

/// Segments of the rendition chosen for one source item.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    /// `None` when the item URL pointed straight at a media playlist.
    pub selection: Option<Selection>,
    pub segments: Vec<Segment>,
}

/// Fetches playlists and follows a master playlist to its selected rendition.
pub struct PlaylistLoader {
    source: Arc<dyn RemoteSource>,
    resolver: PlaylistResolver,
    retry: RetryPolicy,
    token: CancellationToken,
}

impl PlaylistLoader {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        resolver: PlaylistResolver,
        retry: RetryPolicy,
        token: CancellationToken,
    ) -> Self {
        Self {
            source,
            resolver,
            retry,
            token,
        }
    }

    pub async fn fetch_playlist(&self, url: &Url) -> Result<ParsedPlaylist> {
        let text = retry_with_backoff(&self.retry, &self.token, |_| async {
            RetryAction::from_result(self.source.fetch_text(url).await)
        })
        .await?;
        self.resolver.parse(&text, url)
    }

    /// Renditions listed at `url`, or an empty list for a media playlist.
    pub async fn renditions(&self, url: &Url) -> Result<Vec<Rendition>> {
        match self.fetch_playlist(url).await? {
            ParsedPlaylist::Master { renditions } => Ok(renditions),
            ParsedPlaylist::Media { .. } => Ok(Vec::new()),
        }
    }

    #[instrument(skip(self), fields(url = %url))]
    pub async fn load(&self, url: &Url) -> Result<ResolvedSource> {
        let (selection, media) = match self.fetch_playlist(url).await? {
            ParsedPlaylist::Master { renditions } => {
                let selection = self.resolver.select(&renditions)?;
                debug!(
                    bandwidth = selection.rendition.bandwidth,
                    uri = %selection.rendition.uri,
                    "Following selected rendition"
                );
                let media = self.fetch_playlist(&selection.rendition.uri).await?;
                (Some(selection), media)
            }
            media => (None, media),
        };

        match media {
            ParsedPlaylist::Media { segments, .. } if segments.is_empty() => {
                Err(AssemblyError::malformed(0, "media playlist lists no segments"))
            }
            ParsedPlaylist::Media { segments, .. } => Ok(ResolvedSource { selection, segments }),
            ParsedPlaylist::Master { .. } => Err(AssemblyError::malformed(
                0,
                "rendition URI points at another master playlist",
            )),
        }
    }
}

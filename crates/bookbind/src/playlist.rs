//! Playlist parsing and rendition selection.
//!
//! Documents go through two passes. A line scan enforces the structural rules that
//! need line context (signature, `BANDWIDTH` on every stream-info line, declared
//! sequence order); `m3u8-rs` then builds the typed playlist.

use m3u8_rs::{Playlist, parse_playlist_res};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::{AssemblyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u64,
    pub height: u64,
}

/// One quality variant listed by a master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    /// Position in the master playlist after de-duplication.
    pub id: usize,
    pub bandwidth: u64,
    pub resolution: Option<Resolution>,
    pub codecs: Option<String>,
    pub uri: Url,
}

impl Rendition {
    pub fn height(&self) -> Option<u64> {
        self.resolution.map(|r| r.height)
    }
}

/// Absolute byte window of a segment inside its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    /// Value for the HTTP `Range` header.
    pub fn header_value(&self) -> String {
        format!(
            "bytes={}-{}",
            self.offset,
            self.offset.saturating_add(self.length.saturating_sub(1))
        )
    }
}

/// One chunk of a rendition's media stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Zero-based position in the rendition.
    pub index: u64,
    /// Sequence number as declared by the playlist (`EXT-X-MEDIA-SEQUENCE` + position).
    pub sequence: u64,
    pub uri: Url,
    /// Duration hint from `#EXTINF`; informational only.
    pub duration_hint: Duration,
    pub byte_range: Option<ByteRange>,
}

impl Segment {
    pub fn byte_length(&self) -> Option<u64> {
        self.byte_range.map(|r| r.length)
    }

    /// File extension taken from the URI path, `ts` when there is none.
    pub fn extension(&self) -> &str {
        self.uri
            .path_segments()
            .and_then(|mut s| s.next_back())
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("ts")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPlaylist {
    Master { renditions: Vec<Rendition> },
    Media { segments: Vec<Segment>, ended: bool },
}

/// Minimum quality a rendition must reach to be preferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityThreshold {
    pub min_bandwidth: u64,
    pub min_height: Option<u64>,
}

impl QualityThreshold {
    pub fn is_met_by(&self, rendition: &Rendition) -> bool {
        if rendition.bandwidth < self.min_bandwidth {
            return false;
        }
        match self.min_height {
            Some(min) => rendition.height().is_some_and(|h| h >= min),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub rendition: Rendition,
    /// False when nothing met the threshold and the best available was taken.
    pub meets_threshold: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PlaylistResolver {
    threshold: QualityThreshold,
}

impl PlaylistResolver {
    pub fn new(threshold: QualityThreshold) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> QualityThreshold {
        self.threshold
    }

    /// Parses `document`, resolving relative URIs against `source`.
    pub fn parse(&self, document: &str, source: &Url) -> Result<ParsedPlaylist> {
        let scan = scan_lines(document)?;

        let body = document.trim_start_matches('\u{feff}').trim_start();
        let parsed = parse_playlist_res(body.as_bytes())
            .map_err(|_| AssemblyError::malformed(0, "playlist structure rejected by parser"))?;

        match (parsed, scan.kind) {
            (Playlist::MasterPlaylist(master), DocumentKind::Master) => {
                let mut seen = HashSet::new();
                let mut renditions = Vec::new();
                let variants = master.variants.iter().filter(|v| !v.is_i_frame);
                for (variant, line) in variants.zip(scan.uri_lines.iter().copied()) {
                    if !seen.insert(variant.bandwidth) {
                        debug!(
                            bandwidth = variant.bandwidth,
                            line, "Skipping rendition with duplicate bandwidth"
                        );
                        continue;
                    }
                    let uri = source.join(&variant.uri).map_err(|e| {
                        AssemblyError::malformed(line, format!("bad rendition URI: {e}"))
                    })?;
                    renditions.push(Rendition {
                        id: renditions.len(),
                        bandwidth: variant.bandwidth,
                        resolution: variant.resolution.map(|r| Resolution {
                            width: r.width,
                            height: r.height,
                        }),
                        codecs: variant.codecs.clone(),
                        uri,
                    });
                }
                if renditions.is_empty() {
                    return Err(AssemblyError::malformed(0, "master playlist lists no renditions"));
                }
                Ok(ParsedPlaylist::Master { renditions })
            }
            (Playlist::MediaPlaylist(media), DocumentKind::Media) => {
                if media.segments.len() != scan.uri_lines.len() {
                    return Err(AssemblyError::malformed(
                        scan.uri_lines.last().copied().unwrap_or(0),
                        format!(
                            "parser found {} segments but {} segment lines are declared",
                            media.segments.len(),
                            scan.uri_lines.len()
                        ),
                    ));
                }

                let mut next_offsets: HashMap<&str, u64> = HashMap::new();
                let mut segments = Vec::with_capacity(media.segments.len());
                for (position, (segment, line)) in media
                    .segments
                    .iter()
                    .zip(scan.uri_lines.iter().copied())
                    .enumerate()
                {
                    let uri = source.join(&segment.uri).map_err(|e| {
                        AssemblyError::malformed(line, format!("bad segment URI: {e}"))
                    })?;
                    let byte_range = match &segment.byte_range {
                        Some(range) => {
                            if range.length == 0 {
                                return Err(AssemblyError::malformed(line, "empty byte range"));
                            }
                            let offset = range.offset.unwrap_or_else(|| {
                                next_offsets.get(segment.uri.as_str()).copied().unwrap_or(0)
                            });
                            let end = offset
                                .checked_add(range.length)
                                .ok_or_else(|| AssemblyError::malformed(line, "byte range overflows"))?;
                            next_offsets.insert(segment.uri.as_str(), end);
                            Some(ByteRange {
                                offset,
                                length: range.length,
                            })
                        }
                        None => None,
                    };
                    let sequence = scan
                        .media_sequence
                        .checked_add(position as u64)
                        .ok_or_else(|| AssemblyError::malformed(line, "media sequence overflows"))?;
                    segments.push(Segment {
                        index: position as u64,
                        sequence,
                        uri,
                        duration_hint: Duration::from_secs_f64(f64::from(segment.duration).max(0.0)),
                        byte_range,
                    });
                }
                Ok(ParsedPlaylist::Media {
                    segments,
                    ended: media.end_list,
                })
            }
            _ => Err(AssemblyError::malformed(
                0,
                "parser and line scan disagree on playlist kind",
            )),
        }
    }

    /// Picks the lowest rendition that still meets the threshold, or the highest
    /// available one (with a warning) when none does.
    ///
    /// With a height threshold the order is (height, bandwidth); otherwise bandwidth alone.
    pub fn select(&self, renditions: &[Rendition]) -> Result<Selection> {
        let by_height = self.threshold.min_height.is_some();
        let order_key = |r: &Rendition| {
            if by_height {
                (r.height().unwrap_or(0), r.bandwidth)
            } else {
                (r.bandwidth, 0)
            }
        };

        if let Some(best) = renditions
            .iter()
            .filter(|r| self.threshold.is_met_by(r))
            .min_by_key(|r| order_key(r))
        {
            debug!(
                bandwidth = best.bandwidth,
                height = ?best.height(),
                "Selected rendition"
            );
            return Ok(Selection {
                rendition: best.clone(),
                meets_threshold: true,
            });
        }

        let fallback = renditions
            .iter()
            .max_by_key(|r| (r.bandwidth, r.height().unwrap_or(0)))
            .ok_or_else(|| AssemblyError::malformed(0, "no renditions to select from"))?;
        warn!(
            bandwidth = fallback.bandwidth,
            min_bandwidth = self.threshold.min_bandwidth,
            min_height = ?self.threshold.min_height,
            "No rendition meets the quality threshold, using the highest available"
        );
        Ok(Selection {
            rendition: fallback.clone(),
            meets_threshold: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentKind {
    Master,
    Media,
}

#[derive(Debug)]
struct LineScan {
    kind: DocumentKind,
    media_sequence: u64,
    /// 1-based line numbers of rendition or segment URIs, in document order.
    uri_lines: Vec<usize>,
}

fn scan_lines(document: &str) -> Result<LineScan> {
    let mut lines = document
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_start_matches('\u{feff}').trim()));

    match lines.by_ref().find(|(_, line)| !line.is_empty()) {
        Some((_, line)) if line.starts_with("#EXTM3U") => {}
        Some((line_no, _)) => {
            return Err(AssemblyError::malformed(line_no, "missing #EXTM3U signature"));
        }
        None => return Err(AssemblyError::malformed(1, "empty playlist document")),
    }

    let mut kind: Option<DocumentKind> = None;
    let mut pending_tag: Option<usize> = None;
    let mut media_sequence: Option<u64> = None;
    let mut uri_lines = Vec::new();

    let mut set_kind = |line_no: usize, found: DocumentKind| -> Result<()> {
        match kind {
            Some(existing) if existing != found => Err(AssemblyError::malformed(
                line_no,
                "playlist mixes stream-info and segment entries",
            )),
            _ => {
                kind = Some(found);
                Ok(())
            }
        }
    };

    for (line_no, line) in lines {
        if line.is_empty() {
            continue;
        }

        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            set_kind(line_no, DocumentKind::Master)?;
            if pending_tag.is_some() {
                return Err(AssemblyError::malformed(line_no, "previous entry has no URI"));
            }
            let attrs = parse_attributes(attrs);
            match attrs.get("BANDWIDTH") {
                None => {
                    return Err(AssemblyError::malformed(
                        line_no,
                        "EXT-X-STREAM-INF without BANDWIDTH",
                    ));
                }
                Some(value) if value.parse::<u64>().is_err() => {
                    return Err(AssemblyError::malformed(
                        line_no,
                        format!("invalid BANDWIDTH `{value}`"),
                    ));
                }
                Some(_) => {}
            }
            pending_tag = Some(line_no);
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            set_kind(line_no, DocumentKind::Media)?;
            if pending_tag.is_some() {
                return Err(AssemblyError::malformed(line_no, "previous entry has no URI"));
            }
            let duration = value.split(',').next().unwrap_or_default().trim();
            if !duration.parse::<f64>().is_ok_and(|d| d.is_finite() && d >= 0.0) {
                return Err(AssemblyError::malformed(
                    line_no,
                    format!("invalid segment duration `{duration}`"),
                ));
            }
            pending_tag = Some(line_no);
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            set_kind(line_no, DocumentKind::Media)?;
            let declared: u64 = value.trim().parse().map_err(|_| {
                AssemblyError::malformed(line_no, format!("invalid media sequence `{value}`"))
            })?;
            let listed = uri_lines.len() as u64;
            match media_sequence {
                None if listed == 0 => media_sequence = Some(declared),
                None => {
                    return Err(AssemblyError::malformed(
                        line_no,
                        format!(
                            "media sequence {declared} declared after {listed} segments without a base"
                        ),
                    ));
                }
                Some(base) => {
                    let expected = base.checked_add(listed).ok_or_else(|| {
                        AssemblyError::malformed(line_no, "media sequence overflows")
                    })?;
                    if declared != expected {
                        return Err(AssemblyError::malformed(
                            line_no,
                            format!(
                                "segment sequence {declared} out of order, expected {expected}"
                            ),
                        ));
                    }
                }
            }
        } else if let Some(value) = line.strip_prefix("#EXT-X-BYTERANGE:") {
            let (length, offset) = match value.split_once('@') {
                Some((l, o)) => (l, Some(o)),
                None => (value, None),
            };
            let valid = length.trim().parse::<u64>().is_ok()
                && offset.is_none_or(|o| o.trim().parse::<u64>().is_ok());
            if !valid {
                return Err(AssemblyError::malformed(
                    line_no,
                    format!("invalid byte range `{value}`"),
                ));
            }
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-KEY:") {
            let attrs = parse_attributes(attrs);
            let method = attrs.get("METHOD").map(String::as_str).unwrap_or_default();
            if !method.eq_ignore_ascii_case("NONE") {
                return Err(AssemblyError::malformed(
                    line_no,
                    format!("encrypted segments are not supported (METHOD={method})"),
                ));
            }
        } else if line.starts_with("#EXT-X-MAP:") {
            return Err(AssemblyError::malformed(
                line_no,
                "fMP4 initialization segments (EXT-X-MAP) are not supported",
            ));
        } else if line.starts_with('#') {
            continue;
        } else {
            if pending_tag.take().is_none() {
                return Err(AssemblyError::malformed(
                    line_no,
                    "URI without a preceding #EXTINF or #EXT-X-STREAM-INF",
                ));
            }
            uri_lines.push(line_no);
        }
    }

    if let Some(line_no) = pending_tag {
        return Err(AssemblyError::malformed(line_no, "entry has no URI"));
    }

    let kind = kind.ok_or_else(|| {
        AssemblyError::malformed(1, "playlist has neither renditions nor segments")
    })?;

    Ok(LineScan {
        kind,
        media_sequence: media_sequence.unwrap_or(0),
        uri_lines,
    })
}

/// Splits an attribute list, honouring quoted values that contain commas.
fn parse_attributes(input: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after_key)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().to_ascii_uppercase();
        let (value, remainder) = if let Some(quoted) = after_key.strip_prefix('"') {
            match quoted.split_once('"') {
                Some((value, remainder)) => (value, remainder),
                None => (quoted, ""),
            }
        } else {
            match after_key.split_once(',') {
                Some((value, remainder)) => (value, remainder),
                None => (after_key, ""),
            }
        };
        attrs.insert(key, value.trim().to_string());
        rest = remainder.trim_start_matches(',').trim();
    }

    attrs
}

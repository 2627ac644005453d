use std::fmt;

use serde::{Serialize, Serializer};

use crate::dash::VideoStream;

/// A playlist payload must open with this header to count as valid.
pub const PLAYLIST_HEADER: &str = "#EXTM3U";

/// Bitrate id to quality tier. Upstream adds tiers by adding BIDs; unknown
/// ones keep their numeric ordering and a synthetic label.
const BID_TIERS: &[(i64, QualityTier)] = &[
    (200, QualityTier::P360),
    (300, QualityTier::P480),
    (500, QualityTier::P720),
    (600, QualityTier::P1080),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    P360,
    P480,
    P720,
    P1080,
    Other(i64),
}

impl QualityTier {
    pub fn for_bid(bid: i64) -> Self {
        BID_TIERS
            .iter()
            .find(|(b, _)| *b == bid)
            .map(|(_, tier)| *tier)
            .unwrap_or(QualityTier::Other(bid))
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityTier::P360 => write!(f, "360P"),
            QualityTier::P480 => write!(f, "480P"),
            QualityTier::P720 => write!(f, "720P"),
            QualityTier::P1080 => write!(f, "1080P"),
            QualityTier::Other(bid) => write!(f, "BID_{}", bid),
        }
    }
}

impl Serialize for QualityTier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum QualityError {
    #[error("no variant carries structurally valid playlist content")]
    NoQualityFound,
}

pub fn is_valid_playlist(payload: &str) -> bool {
    payload.starts_with(PLAYLIST_HEADER)
}

/// Picks the variant with the numerically highest BID whose playlist payload
/// is structurally valid. Ties keep the earliest-listed variant.
pub fn select_best(variants: &[VideoStream]) -> Result<&VideoStream, QualityError> {
    let mut best: Option<&VideoStream> = None;

    for variant in variants {
        let valid = variant
            .m3u8
            .as_deref()
            .map(is_valid_playlist)
            .unwrap_or(false);
        if !valid {
            debug!(
                "skipping variant bid {} ({}): no valid playlist payload",
                variant.bid,
                QualityTier::for_bid(variant.bid)
            );
            continue;
        }
        match best {
            Some(current) if current.bid >= variant.bid => {}
            _ => best = Some(variant),
        }
    }

    best.ok_or(QualityError::NoQualityFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(bid: i64, m3u8: Option<&str>) -> VideoStream {
        VideoStream {
            bid,
            m3u8: m3u8.map(|s| s.to_string()),
            fs: None,
            duration: None,
        }
    }

    #[test]
    fn highest_valid_bid_wins() {
        let variants = vec![
            variant(200, Some("#EXTM3U\n#EXTINF:10.0,\nhttps://seg/1\n")),
            variant(300, None),
            variant(500, Some("#EXTM3U\n#EXTINF:10.0,\nhttps://seg/1\n")),
            variant(600, Some("not a playlist")),
        ];

        let best = select_best(&variants).expect("a variant qualifies");
        assert_eq!(best.bid, 500);
        assert_eq!(QualityTier::for_bid(best.bid).to_string(), "720P");
    }

    #[test]
    fn ties_keep_listing_order() {
        let variants = vec![
            variant(500, Some("#EXTM3U\nfirst")),
            variant(500, Some("#EXTM3U\nsecond")),
        ];
        let best = select_best(&variants).unwrap();
        assert_eq!(best.m3u8.as_deref(), Some("#EXTM3U\nfirst"));
    }

    #[test]
    fn nothing_valid_is_an_error() {
        let variants = vec![variant(200, None), variant(600, Some("<html>"))];
        assert!(matches!(
            select_best(&variants),
            Err(QualityError::NoQualityFound)
        ));
        assert!(matches!(select_best(&[]), Err(QualityError::NoQualityFound)));
    }

    #[test]
    fn unknown_bids_still_order() {
        let variants = vec![
            variant(600, Some("#EXTM3U\n")),
            variant(800, Some("#EXTM3U\n")),
        ];
        let best = select_best(&variants).unwrap();
        assert_eq!(best.bid, 800);
        assert_eq!(QualityTier::for_bid(best.bid).to_string(), "BID_800");
    }

    #[test]
    fn tier_labels() {
        assert_eq!(QualityTier::for_bid(200).to_string(), "360P");
        assert_eq!(QualityTier::for_bid(300).to_string(), "480P");
        assert_eq!(QualityTier::for_bid(500).to_string(), "720P");
        assert_eq!(QualityTier::for_bid(600).to_string(), "1080P");
    }
}

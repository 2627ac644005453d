use serde::Serialize;

/// Empirical per-segment size used for the byte estimate, from observed
/// segment weights on this upstream.
const SEGMENT_SIZE_ESTIMATE: u64 = 500_000;

/// Informational diagnostics over a variant's playlist text. Not a
/// correctness gate: malformed input yields zeroed stats, never an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PlaylistStats {
    pub segment_count: u64,
    pub duration_secs: f64,
    pub estimated_bytes: u64,
}

pub fn analyze(playlist: &str) -> PlaylistStats {
    let mut stats = PlaylistStats::default();

    for line in playlist.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let duration = rest
                .split(',')
                .next()
                .and_then(|d| d.trim().parse::<f64>().ok())
                .unwrap_or(0.0);
            stats.duration_secs += duration;
        } else if line.starts_with("http://") || line.starts_with("https://") {
            stats.segment_count += 1;
        }
    }

    stats.estimated_bytes = stats.segment_count * SEGMENT_SIZE_ESTIMATE;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_sums() {
        let playlist = "#EXTM3U\n\
            #EXT-X-TARGETDURATION:10\n\
            #EXTINF:10.0,\n\
            https://seg.example.com/1.ts\n\
            #EXTINF:10.0,\n\
            https://seg.example.com/2.ts\n\
            #EXTINF:10.0,\n\
            https://seg.example.com/3.ts\n\
            #EXT-X-ENDLIST\n";

        let stats = analyze(playlist);
        assert_eq!(stats.segment_count, 3);
        assert_eq!(stats.duration_secs, 30.0);
        assert_eq!(stats.estimated_bytes, 3 * SEGMENT_SIZE_ESTIMATE);
    }

    #[test]
    fn malformed_input_zeroes_out() {
        assert_eq!(analyze(""), PlaylistStats::default());
        assert_eq!(analyze("<html>not a playlist</html>"), PlaylistStats::default());

        // Unparseable duration contributes nothing; the directive still
        // does not crash the scan.
        let stats = analyze("#EXTINF:abc,\nhttps://seg.example.com/1.ts\n");
        assert_eq!(stats.duration_secs, 0.0);
        assert_eq!(stats.segment_count, 1);
    }

    #[test]
    fn relative_segments_are_not_counted() {
        let stats = analyze("#EXTM3U\n#EXTINF:4.5,\nseg/relative.ts\n");
        assert_eq!(stats.segment_count, 0);
        assert_eq!(stats.duration_secs, 4.5);
    }
}

//! Sparse keyframe-time index.
//!
//! Holds the presentation times (µs) of a track's sync samples so forward
//! seeks can jump straight to the closest keyframe instead of decoding every
//! frame in between. The index is optional: without it the seek engine only
//! decodes sequentially (or reseeks backwards through the demuxer).

use std::path::Path;

use log::debug;

use super::media::FfmpegBackend;

/// Sorted, deduplicated sync-sample presentation times in microseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyframeIndex {
    times_us: Vec<i64>,
}

impl KeyframeIndex {
    /// Build from unsorted times. Returns None when there is nothing to index.
    pub fn from_times(mut times_us: Vec<i64>) -> Option<Self> {
        if times_us.is_empty() {
            return None;
        }
        times_us.sort_unstable();
        times_us.dedup();
        Some(Self { times_us })
    }

    /// Best-effort index for any container FFmpeg can demux. Any failure
    /// yields None.
    pub fn build(path: &Path) -> Option<Self> {
        match FfmpegBackend::scan_keyframes(path) {
            Ok(times) => {
                let index = Self::from_times(times);
                if let Some(index) = &index {
                    debug!(
                        "Keyframe index for {}: {} sync samples (interval ~{}us)",
                        path.display(),
                        index.len(),
                        index.interval_hint_us()
                    );
                }
                index
            }
            Err(e) => {
                debug!("No keyframe index for {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Sync sample at or before `time_us`.
    ///
    /// Requests before the first entry resolve to the first entry (the
    /// stream start), which is where decoding would begin anyway.
    pub fn sync_at_or_before(&self, time_us: i64) -> i64 {
        let idx = self.times_us.partition_point(|&t| t <= time_us);
        if idx == 0 {
            self.times_us[0]
        } else {
            self.times_us[idx - 1]
        }
    }

    pub fn len(&self) -> usize {
        self.times_us.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times_us.is_empty()
    }

    pub fn times_us(&self) -> &[i64] {
        &self.times_us
    }

    /// Largest gap between consecutive sync samples (0 for a single entry).
    pub fn interval_hint_us(&self) -> i64 {
        self.times_us
            .windows(2)
            .map(|w| w[1] - w[0])
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_none() {
        assert!(KeyframeIndex::from_times(Vec::new()).is_none());
    }

    #[test]
    fn test_sorted_and_deduplicated() {
        let index = KeyframeIndex::from_times(vec![2_000_000, 0, 1_000_000, 1_000_000]).unwrap();
        assert_eq!(index.times_us(), &[0, 1_000_000, 2_000_000]);
        assert_eq!(index.interval_hint_us(), 1_000_000);
    }

    #[test]
    fn test_sync_at_or_before() {
        let index = KeyframeIndex::from_times(vec![0, 1_000_000, 2_000_000]).unwrap();
        assert_eq!(index.sync_at_or_before(0), 0);
        assert_eq!(index.sync_at_or_before(999_999), 0);
        assert_eq!(index.sync_at_or_before(1_000_000), 1_000_000);
        assert_eq!(index.sync_at_or_before(5_000_000), 2_000_000);
    }

    #[test]
    fn test_before_first_entry_clamps_to_start() {
        let index = KeyframeIndex::from_times(vec![40_000, 1_040_000]).unwrap();
        assert_eq!(index.sync_at_or_before(0), 40_000);
    }

    #[test]
    fn test_build_missing_file_is_none() {
        assert!(KeyframeIndex::build(Path::new("/nonexistent/clip.mp4")).is_none());
    }

    #[test]
    fn test_build_garbage_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mp4");
        let mut bytes = Vec::new();
        // ftyp, then a 64-bit sized box claiming u64::MAX bytes
        bytes.extend_from_slice(&16u32.to_be_bytes());
        bytes.extend_from_slice(b"ftypisom");
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(b"free");
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(KeyframeIndex::build(&path).is_none());
    }
}

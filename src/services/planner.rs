use crate::models::ChunkRange;

/// Below this size a single streamed GET beats ranged chunks.
pub const SIMPLE_THRESHOLD_BYTES: u64 = 50 * 1024 * 1024;
/// Chunk sizes are rounded up to this boundary.
const CHUNK_ALIGN: u64 = 64 * 1024;

const MB: u64 = 1024 * 1024;

/// Per-size-band transfer policy: the physical chunk count (also the
/// initial connection target) and the ceiling the adaptive governor may
/// grow concurrency to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBand {
    pub chunk_count: usize,
    pub initial_concurrency: usize,
    pub max_concurrency: usize,
}

pub fn band_for(total_bytes: u64) -> ChunkBand {
    if total_bytes < SIMPLE_THRESHOLD_BYTES {
        ChunkBand {
            chunk_count: 1,
            initial_concurrency: 1,
            max_concurrency: 1,
        }
    } else if total_bytes < 500 * MB {
        ChunkBand {
            chunk_count: 4,
            initial_concurrency: 4,
            max_concurrency: 8,
        }
    } else if total_bytes <= 2048 * MB {
        ChunkBand {
            chunk_count: 8,
            initial_concurrency: 8,
            max_concurrency: 16,
        }
    } else {
        ChunkBand {
            chunk_count: 12,
            initial_concurrency: 12,
            max_concurrency: 16,
        }
    }
}

/// The band's chunk count; the on-disk plan is fixed at start even when the
/// governor later moves concurrency inside the band's range.
pub fn chunk_count_for(total_bytes: u64) -> usize {
    band_for(total_bytes).chunk_count
}

/// Deterministic range plan: `count` contiguous inclusive ranges that
/// partition `[0, total_bytes - 1]`. All chunks except the last share one
/// 64 KiB-aligned size; the last absorbs the remainder.
pub fn plan_chunks(total_bytes: u64, count: usize) -> Vec<ChunkRange> {
    if total_bytes == 0 {
        return Vec::new();
    }
    let count = count.max(1) as u64;
    let raw = total_bytes.div_ceil(count);
    let chunk_size = raw.div_ceil(CHUNK_ALIGN) * CHUNK_ALIGN;
    // Alignment can make trailing chunks redundant for small totals.
    let effective = total_bytes.div_ceil(chunk_size).min(count);

    let mut ranges = Vec::with_capacity(effective as usize);
    for index in 0..effective {
        let start = index * chunk_size;
        let end = if index == effective - 1 {
            total_bytes - 1
        } else {
            start + chunk_size - 1
        };
        ranges.push(ChunkRange {
            index: index as u32,
            start: start as i64,
            end: end as i64,
        });
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partitions(ranges: &[ChunkRange], total: u64) {
        assert!(!ranges.is_empty());
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[ranges.len() - 1].end, total as i64 - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[1].start, pair[0].end + 1, "ranges must be contiguous");
        }
        let covered: i64 = ranges.iter().map(|range| range.len()).sum();
        assert_eq!(covered, total as i64);
    }

    #[test]
    fn bands_match_the_policy_table() {
        assert_eq!(chunk_count_for(1), 1);
        assert_eq!(chunk_count_for(49 * MB), 1);
        assert_eq!(chunk_count_for(50 * MB), 4);
        assert_eq!(chunk_count_for(499 * MB), 4);
        assert_eq!(chunk_count_for(500 * MB), 8);
        assert_eq!(chunk_count_for(2048 * MB), 8);
        assert_eq!(chunk_count_for(3 * 1024 * MB), 12);
    }

    #[test]
    fn band_concurrency_starts_at_the_initial_target() {
        let mid = band_for(200 * MB);
        assert_eq!(mid.initial_concurrency, 4);
        assert_eq!(mid.max_concurrency, 8);

        let large = band_for(1024 * MB);
        assert_eq!(large.initial_concurrency, 8);
        assert_eq!(large.max_concurrency, 16);

        let huge = band_for(3 * 1024 * MB);
        assert_eq!(huge.chunk_count, 12);
        assert_eq!(huge.initial_concurrency, 12);
        assert_eq!(huge.max_concurrency, 16);
    }

    #[test]
    fn plans_partition_exactly() {
        for total in [
            1u64,
            CHUNK_ALIGN - 1,
            CHUNK_ALIGN,
            CHUNK_ALIGN + 1,
            50 * MB,
            200_000_000,
            500 * MB + 7,
            3 * 1024 * MB + 12345,
        ] {
            let count = chunk_count_for(total);
            let ranges = plan_chunks(total, count);
            assert_partitions(&ranges, total);
            assert!(ranges.len() <= count);
        }
    }

    #[test]
    fn chunk_sizes_are_aligned_except_the_tail() {
        let ranges = plan_chunks(200_000_000, 4);
        for range in &ranges[..ranges.len() - 1] {
            assert_eq!(range.len() as u64 % CHUNK_ALIGN, 0);
        }
        assert_partitions(&ranges, 200_000_000);
    }

    #[test]
    fn tiny_totals_collapse_to_fewer_chunks() {
        // 100 KiB asked to split 4 ways cannot produce 4 aligned chunks.
        let ranges = plan_chunks(100 * 1024, 4);
        assert_partitions(&ranges, 100 * 1024);
        assert!(ranges.len() <= 2);
    }

    #[test]
    fn zero_bytes_has_no_plan() {
        assert!(plan_chunks(0, 4).is_empty());
    }

    #[test]
    fn plan_is_deterministic() {
        let a = plan_chunks(987_654_321, 8);
        let b = plan_chunks(987_654_321, 8);
        assert_eq!(a, b);
    }
}

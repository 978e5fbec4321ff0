//! Chunk planning - splits a resource into byte ranges

use crate::engine::transport::ResourceInfo;
use crate::error::EngineError;
use rangefetch_types::FileChunk;
use std::ops::Range;
use std::path::Path;
use tracing::info;

/// Most chunks one resource may be split into
pub const MAX_CHUNKS: u64 = 1 << 20;

/// Partition `[0, total_size)` into contiguous ranges of at most `chunk_size`
/// bytes. The last range takes whatever is left. A zero-byte resource gets one
/// empty range so the destination file is still created.
///
/// Fails if the split would need more than [`MAX_CHUNKS`] ranges.
pub fn plan_ranges(total_size: u64, chunk_size: u64) -> Result<Vec<Range<u64>>, EngineError> {
    if chunk_size == 0 {
        return Err(EngineError::Validation("chunk size must be greater than zero".into()));
    }

    if total_size == 0 {
        return Ok(vec![0..0]);
    }

    let count = total_size.div_ceil(chunk_size);
    if count > MAX_CHUNKS {
        return Err(EngineError::Validation(format!(
            "{} bytes in chunks of {} needs {} chunks, more than {}",
            total_size, chunk_size, count, MAX_CHUNKS
        )));
    }
    let ranges = (0..count)
        .map(|i| {
            let start = i * chunk_size;
            start..start.saturating_add(chunk_size).min(total_size)
        })
        .collect();

    Ok(ranges)
}

/// Plan the chunks for one download.
///
/// Falls back to a single chunk over the whole resource when the server did
/// not advertise range support or the size is unknown.
pub fn plan(
    url: &str,
    resource: &ResourceInfo,
    chunk_size: u64,
    work_dir: &Path,
) -> Result<Vec<FileChunk>, EngineError> {
    let total_size = match resource.total_size {
        Some(size) if resource.accepts_ranges => size,
        other => {
            info!(
                "Planning single chunk for {} (size: {:?}, ranges: {})",
                url, other, resource.accepts_ranges
            );
            if chunk_size == 0 {
                return Err(EngineError::Validation("chunk size must be greater than zero".into()));
            }
            return Ok(vec![FileChunk::new(0, url.to_string(), part_path(work_dir, 0), 0, other)]);
        }
    };

    let chunks: Vec<FileChunk> = plan_ranges(total_size, chunk_size)?
        .into_iter()
        .enumerate()
        .map(|(index, range)| {
            let index = index as u32;
            FileChunk::new(
                index,
                url.to_string(),
                part_path(work_dir, index),
                range.start,
                Some(range.end),
            )
        })
        .collect();

    info!(
        "Planned {} chunks of up to {} bytes for {} ({} bytes)",
        chunks.len(),
        chunk_size,
        url,
        total_size
    );
    Ok(chunks)
}

/// Part file for chunk `index` inside a request's working directory
pub fn part_path(work_dir: &Path, index: u32) -> std::path::PathBuf {
    work_dir.join(format!("chunk_{}.part", index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ranged(size: u64) -> ResourceInfo {
        ResourceInfo {
            total_size: Some(size),
            accepts_ranges: true,
        }
    }

    #[test]
    fn test_ten_kib_in_four_kib_chunks() {
        let chunks = plan("http://host/file", &ranged(10 * 1024), 4 * 1024, Path::new("/w")).unwrap();
        let sizes: Vec<_> = chunks.iter().map(|c| c.len().unwrap()).collect();
        assert_eq!(sizes, vec![4096, 4096, 2048]);
        assert_eq!(chunks[2].start, 8192);
        assert_eq!(chunks[2].end, Some(10240));
        assert_eq!(chunks[1].part_path, Path::new("/w/chunk_1.part"));
    }

    #[test]
    fn test_zero_size_gets_one_empty_chunk() {
        let chunks = plan("http://host/empty", &ranged(0), 1024, Path::new("/w")).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        assert_eq!(plan_ranges(8192, 4096).unwrap(), vec![0..4096, 4096..8192]);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(plan_ranges(10, 0), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_no_range_support_falls_back_to_single_chunk() {
        let info = ResourceInfo {
            total_size: Some(10 * 1024),
            accepts_ranges: false,
        };
        let chunks = plan("http://host/file", &info, 1024, Path::new("/w")).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, Some(10 * 1024));
    }

    #[test]
    fn test_unknown_size_is_open_ended() {
        let info = ResourceInfo {
            total_size: None,
            accepts_ranges: true,
        };
        let chunks = plan("http://host/stream", &info, 1024, Path::new("/w")).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_open_ended());
    }

    #[test]
    fn test_huge_sizes_do_not_overflow() {
        assert_eq!(
            plan_ranges(u64::MAX, u64::MAX - 1).unwrap(),
            vec![0..u64::MAX - 1, u64::MAX - 1..u64::MAX]
        );
        assert_eq!(plan_ranges(u64::MAX, u64::MAX).unwrap(), vec![0..u64::MAX]);
    }

    #[test]
    fn test_too_many_chunks_rejected() {
        assert!(matches!(plan_ranges(u64::MAX, 1), Err(EngineError::Validation(_))));
        assert!(matches!(
            plan_ranges(MAX_CHUNKS + 1, 1),
            Err(EngineError::Validation(_))
        ));
        assert_eq!(plan_ranges(MAX_CHUNKS, 1).unwrap().len() as u64, MAX_CHUNKS);

        let info = ranged(u64::MAX);
        assert!(plan("http://host/huge", &info, 4096, Path::new("/w")).is_err());
    }

    proptest! {
        #[test]
        fn prop_ranges_partition_exactly(total in 0u64..5_000_000, chunk in 1u64..1_000_000) {
            let ranges = plan_ranges(total, chunk).unwrap();
            let mut cursor = 0;
            for (i, range) in ranges.iter().enumerate() {
                prop_assert_eq!(range.start, cursor);
                prop_assert!(range.end - range.start <= chunk);
                if i + 1 < ranges.len() {
                    prop_assert_eq!(range.end - range.start, chunk);
                }
                cursor = range.end;
            }
            prop_assert_eq!(cursor, total);
        }

        #[test]
        fn prop_large_totals_partition_or_refuse(total in 1u64..=u64::MAX, chunk in 1u64..=u64::MAX) {
            match plan_ranges(total, chunk) {
                Ok(ranges) => {
                    prop_assert!(ranges.len() as u64 <= MAX_CHUNKS);
                    let mut cursor = 0;
                    for range in &ranges {
                        prop_assert_eq!(range.start, cursor);
                        prop_assert!(range.end > range.start);
                        prop_assert!(range.end - range.start <= chunk);
                        cursor = range.end;
                    }
                    prop_assert_eq!(cursor, total);
                }
                Err(_) => prop_assert!(total.div_ceil(chunk) > MAX_CHUNKS),
            }
        }
    }
}

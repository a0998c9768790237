//! Units of fetch work and the planners that produce them.
//!
//! A run is planned up front as a finite list of segments: paged search
//! windows against the FHIR search API, or id batches resolved from the
//! backing database. Segments are value objects; the executor imposes no
//! ordering between them.

/// One paged FHIR query window.
///
/// `page_token` is the verbatim `_getpages=<token>` parameter extracted from
/// the probe bundle's `next` link; `offset` is the starting row of the page.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SearchSegment {
    pub page_token: String,
    pub offset: u64,
    pub count: usize,
}

/// One `_id=a,b,c` fetch against a resource type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdBatch {
    pub resource_type: String,
    pub joined_ids: String,
    pub size: usize,
}

/// A half-open id range `[from, to)` over a source table.
///
/// The partitioner treats the final range of a table as closed so that
/// `MAX(id)` itself is captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdRange {
    pub from: i64,
    pub to: i64,
}

/// A planned unit of work for the executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchTask {
    Page(SearchSegment),
    Ids(IdBatch),
}

/// Plans search segments covering `[0, total)` with no gaps and no overlap.
pub fn plan_search_segments(page_token: &str, total: u64, page_size: usize) -> Vec<SearchSegment> {
    if total == 0 || page_size == 0 {
        return Vec::new();
    }

    (0..total)
        .step_by(page_size)
        .map(|offset| SearchSegment {
            page_token: page_token.to_string(),
            offset,
            count: page_size,
        })
        .collect()
}

/// Splits `[0, max_id]` into contiguous ranges of width `batch_size`.
///
/// For `max_id = 200, batch_size = 100` this yields exactly `(0, 100)` and
/// `(100, 200)`; the caller queries the last range with a closed upper bound.
pub fn create_id_ranges(max_id: i64, batch_size: i64) -> Vec<IdRange> {
    if max_id <= 0 || batch_size <= 0 {
        return Vec::new();
    }

    let mut ranges = Vec::new();
    let mut from = 0;
    while from < max_id {
        let to = (from + batch_size).min(max_id);
        ranges.push(IdRange { from, to });
        from = to;
    }
    ranges
}

/// Groups uuids into [`IdBatch`]es of at most `fetch_size` ids each.
pub fn chunk_into_batches(resource_type: &str, uuids: &[String], fetch_size: usize) -> Vec<IdBatch> {
    if fetch_size == 0 {
        return Vec::new();
    }

    uuids
        .chunks(fetch_size)
        .map(|chunk| IdBatch {
            resource_type: resource_type.to_string(),
            joined_ids: chunk.join(","),
            size: chunk.len(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_segment_plan() {
        // 3 resources with a page size of 2 need windows at offsets 0 and 2.
        let segments = plan_search_segments("_getpages=tok", 3, 2);

        assert_eq!(
            segments,
            vec![
                SearchSegment {
                    page_token: "_getpages=tok".to_string(),
                    offset: 0,
                    count: 2
                },
                SearchSegment {
                    page_token: "_getpages=tok".to_string(),
                    offset: 2,
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn test_empty_total_plans_nothing() {
        assert!(plan_search_segments("_getpages=tok", 0, 10).is_empty());
    }

    #[test]
    fn test_segments_cover_total_without_gaps_or_overlap() {
        for total in [1u64, 7, 100, 101, 250] {
            for page_size in [1usize, 3, 50, 100] {
                let segments = plan_search_segments("_getpages=tok", total, page_size);

                let mut covered = 0;
                for (i, segment) in segments.iter().enumerate() {
                    assert_eq!(segment.offset, covered, "gap before segment {i}");
                    covered = segment.offset + segment.count as u64;
                }
                assert!(covered >= total, "plan for total={total} falls short");
                assert!(
                    covered - total < page_size as u64,
                    "plan for total={total} overshoots by a full page"
                );
            }
        }
    }

    #[test]
    fn test_create_id_ranges() {
        let ranges = create_id_ranges(200, 100);
        assert_eq!(
            ranges,
            vec![IdRange { from: 0, to: 100 }, IdRange { from: 100, to: 200 }]
        );
    }

    #[test]
    fn test_id_ranges_are_contiguous_and_end_at_max() {
        for (max_id, batch_size) in [(200, 100), (201, 100), (99, 100), (1000, 33)] {
            let ranges = create_id_ranges(max_id, batch_size);

            assert_eq!(ranges.first().unwrap().from, 0);
            assert_eq!(ranges.last().unwrap().to, max_id);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].to, pair[1].from);
            }
        }
    }

    #[test]
    fn test_id_ranges_empty_table() {
        assert!(create_id_ranges(0, 100).is_empty());
    }

    #[test]
    fn test_chunk_into_batches() {
        let uuids: Vec<String> = (0..6).map(|i| format!("uuid-{i}")).collect();
        let batches = chunk_into_batches("Encounter", &uuids, 3);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].size, 3);
        assert_eq!(batches[0].joined_ids, "uuid-0,uuid-1,uuid-2");
        assert_eq!(batches[1].joined_ids, "uuid-3,uuid-4,uuid-5");
        assert!(batches.iter().all(|b| b.resource_type == "Encounter"));
    }

    #[test]
    fn test_chunk_remainder_batch_is_smaller() {
        let uuids: Vec<String> = (0..7).map(|i| format!("uuid-{i}")).collect();
        let batches = chunk_into_batches("Observation", &uuids, 3);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].size, 1);
    }
}

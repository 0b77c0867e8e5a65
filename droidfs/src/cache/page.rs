//! Page bookkeeping and range arithmetic.

use std::time::{Duration, Instant};

/// Part of a file range that falls inside one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub index: u64,
    pub offset_in_page: usize,
    pub len: usize,
}

impl PageSpan {
    pub fn end_in_page(&self) -> usize {
        self.offset_in_page + self.len
    }

    pub fn covers_whole_page(&self, page_size: usize) -> bool {
        self.offset_in_page == 0 && self.len == page_size
    }
}

/// Split the file range `[offset, offset + len)` into per-page spans.
pub fn split_range(page_size: usize, mut offset: u64, len: usize) -> Vec<PageSpan> {
    let ps = page_size as u64;
    let mut remaining = len as u64;
    let mut out = Vec::new();
    while remaining > 0 {
        let index = offset / ps;
        let off = offset % ps;
        let take = (ps - off).min(remaining);
        out.push(PageSpan {
            index,
            offset_in_page: off as usize,
            len: take as usize,
        });
        offset += take;
        remaining -= take;
    }
    out
}

/// One cached page. `data` holds the valid prefix of the page; anything past
/// its end reads as zeros.
#[derive(Debug)]
pub struct Page {
    pub data: Vec<u8>,
    pub dirty: bool,
    pub fetched_at: Instant,
    /// LRU key, unique across the cache.
    pub touched: u64,
    /// Bumped on every local modification, so a flush only cleans what it wrote.
    pub version: u64,
    /// Bytes accounted against the budget.
    pub charge: u64,
}

impl Page {
    pub fn clean(data: Vec<u8>, touched: u64, charge: u64) -> Self {
        Self {
            data,
            dirty: false,
            fetched_at: Instant::now(),
            touched,
            version: 0,
            charge,
        }
    }

    pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < ttl
    }

    /// Copy `src` in at `at`, zero-filling any gap past the current end.
    pub fn overlay(&mut self, at: usize, src: &[u8]) {
        let end = at + src.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[at..end].copy_from_slice(src);
        self.dirty = true;
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_within_single_page() {
        let spans = split_range(4096, 123, 100);
        assert_eq!(
            spans,
            vec![PageSpan {
                index: 0,
                offset_in_page: 123,
                len: 100
            }]
        );
    }

    #[test]
    fn split_across_pages() {
        let spans = split_range(4096, 4090, 4096 + 10);
        assert_eq!(spans.len(), 3);
        assert_eq!((spans[0].index, spans[0].offset_in_page, spans[0].len), (0, 4090, 6));
        assert!(spans[1].covers_whole_page(4096));
        assert_eq!((spans[2].index, spans[2].offset_in_page, spans[2].len), (2, 0, 4));
    }

    #[test]
    fn zero_len_has_no_spans() {
        assert!(split_range(4096, 10, 0).is_empty());
    }

    #[test]
    fn overlay_fills_gap_with_zeros() {
        let mut p = Page::clean(b"ab".to_vec(), 0, 4096);
        p.overlay(4, b"xy");
        assert_eq!(p.data, b"ab\0\0xy");
        assert!(p.dirty);
        assert_eq!(p.version, 1);
    }
}

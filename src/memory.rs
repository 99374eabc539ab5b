//! Lazy byte-addressed view over the on-device data region.
//!
//! The client never downloads the region wholesale. Reads are served from a
//! session-owned cache of 512-byte aligned chunks; missing chunks are fetched
//! on demand, with contiguous misses coalesced into one ReadMemory command.

use tracing::debug;

use crate::error::{Error, Result};

/// Size of the on-device data region.
pub const REGION_SIZE: u32 = 0x3C_0000;

/// Cache granularity, aligned to the device's preferred transfer unit.
pub const CHUNK_SIZE: u32 = 512;

/// Largest single fetch issued for a run of missing chunks. Bounded by the
/// one-byte packet index of the transfer framing, which caps a reply message
/// well below the region size.
pub const MAX_FETCH: u32 = 8 * 1024;

const CHUNK_COUNT: usize = (REGION_SIZE / CHUNK_SIZE) as usize;

/// Read-only random-access view of the device's data file.
///
/// Reads are idempotent and side-effect-free; repeated reads of the same
/// range return the same bytes until [`MemoryView::invalidate`] is called
/// for an overlapping range.
pub struct MemoryView {
    buf: Vec<u8>,
    present: Vec<bool>,
}

impl MemoryView {
    pub fn new() -> Self {
        Self {
            buf: vec![0; REGION_SIZE as usize],
            present: vec![false; CHUNK_COUNT],
        }
    }

    /// A view pre-populated from a memory dump, for offline decoding.
    ///
    /// Reads beyond the provided image fail instead of fetching.
    pub fn from_image(image: &[u8]) -> Result<Self> {
        if image.len() > REGION_SIZE as usize {
            return Err(Error::Usage(format!(
                "image of {} bytes exceeds the {REGION_SIZE}-byte region",
                image.len()
            )));
        }
        let mut view = Self::new();
        view.buf[..image.len()].copy_from_slice(image);
        let covered = image.len() / CHUNK_SIZE as usize;
        for chunk in 0..covered {
            view.present[chunk] = true;
        }
        if image.len() % CHUNK_SIZE as usize != 0 {
            view.present[covered] = true;
        }
        Ok(view)
    }

    /// Return `[offset, offset + len)`, fetching missing chunks via `fetch`.
    ///
    /// `fetch` receives chunk-aligned windows no larger than [`MAX_FETCH`]
    /// and must return exactly the requested number of bytes.
    pub fn read_with<F>(&mut self, offset: u32, len: u32, mut fetch: F) -> Result<&[u8]>
    where
        F: FnMut(u32, u32) -> Result<Vec<u8>>,
    {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= REGION_SIZE)
            .ok_or_else(|| {
                Error::Usage(format!(
                    "read of {len} bytes at {offset:#x} crosses the region end"
                ))
            })?;
        if len == 0 {
            return Ok(&[]);
        }

        let first_chunk = offset / CHUNK_SIZE;
        let last_chunk = (end - 1) / CHUNK_SIZE;
        let mut chunk = first_chunk;
        while chunk <= last_chunk {
            if self.present[chunk as usize] {
                chunk += 1;
                continue;
            }

            // Coalesce the run of missing chunks starting here.
            let run_start = chunk;
            let mut run_end = chunk;
            while run_end < last_chunk
                && !self.present[(run_end + 1) as usize]
                && (run_end + 2 - run_start) * CHUNK_SIZE <= MAX_FETCH
            {
                run_end += 1;
            }

            let fetch_offset = run_start * CHUNK_SIZE;
            let fetch_len = ((run_end - run_start + 1) * CHUNK_SIZE).min(REGION_SIZE - fetch_offset);
            debug!(
                offset = format_args!("{fetch_offset:#x}"),
                len = fetch_len,
                "fetching memory chunks"
            );
            let bytes = fetch(fetch_offset, fetch_len)?;
            if bytes.len() != fetch_len as usize {
                return Err(Error::Protocol(format!(
                    "short memory read: requested {fetch_len} bytes, got {}",
                    bytes.len()
                )));
            }

            let base = fetch_offset as usize;
            self.buf[base..base + bytes.len()].copy_from_slice(&bytes);
            for c in run_start..=run_end {
                self.present[c as usize] = true;
            }
            chunk = run_end + 1;
        }

        Ok(&self.buf[offset as usize..end as usize])
    }

    /// Drop cached chunks overlapping `[offset, offset + len)`.
    pub fn invalidate(&mut self, offset: u32, len: u32) {
        if len == 0 {
            return;
        }
        let end = offset.saturating_add(len).min(REGION_SIZE);
        let first_chunk = offset / CHUNK_SIZE;
        let last_chunk = (end - 1) / CHUNK_SIZE;
        for chunk in first_chunk..=last_chunk {
            self.present[chunk as usize] = false;
        }
    }

    /// Number of chunks currently cached.
    pub fn cached_chunks(&self) -> usize {
        self.present.iter().filter(|&&p| p).count()
    }
}

impl Default for MemoryView {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Fetcher serving a deterministic pattern and counting calls.
    fn pattern_fetcher(calls: &RefCell<Vec<(u32, u32)>>) -> impl FnMut(u32, u32) -> Result<Vec<u8>> + '_ {
        move |offset, len| {
            calls.borrow_mut().push((offset, len));
            Ok((offset..offset + len).map(|i| (i % 251) as u8).collect())
        }
    }

    #[test]
    fn reads_are_idempotent_and_cached() {
        let calls = RefCell::new(Vec::new());
        let mut view = MemoryView::new();

        let first = view
            .read_with(100, 1000, pattern_fetcher(&calls))
            .unwrap()
            .to_vec();
        let fetches_after_first = calls.borrow().len();
        assert!(fetches_after_first > 0);

        let second = view
            .read_with(100, 1000, pattern_fetcher(&calls))
            .unwrap()
            .to_vec();
        assert_eq!(first, second);
        assert_eq!(calls.borrow().len(), fetches_after_first, "second read must be cache-only");

        // Overlapping read agrees on the overlap.
        let third = view
            .read_with(600, 1000, pattern_fetcher(&calls))
            .unwrap()
            .to_vec();
        assert_eq!(&first[500..], &third[..500]);
    }

    #[test]
    fn contiguous_misses_coalesce() {
        let calls = RefCell::new(Vec::new());
        let mut view = MemoryView::new();

        // Eight chunks in one go: a single fetch.
        view.read_with(0, 8 * CHUNK_SIZE, pattern_fetcher(&calls))
            .unwrap();
        assert_eq!(calls.borrow().as_slice(), &[(0, 8 * CHUNK_SIZE)]);
    }

    #[test]
    fn fetches_are_capped() {
        let calls = RefCell::new(Vec::new());
        let mut view = MemoryView::new();

        view.read_with(0, 3 * MAX_FETCH, pattern_fetcher(&calls))
            .unwrap();
        for &(_, len) in calls.borrow().iter() {
            assert!(len <= MAX_FETCH);
        }
        assert_eq!(calls.borrow().len(), 3);
    }

    #[test]
    fn cached_chunks_are_skipped() {
        let calls = RefCell::new(Vec::new());
        let mut view = MemoryView::new();

        view.read_with(2 * CHUNK_SIZE, CHUNK_SIZE, pattern_fetcher(&calls))
            .unwrap();
        calls.borrow_mut().clear();

        // Chunks 0..5 with chunk 2 already present: two fetches around it.
        view.read_with(0, 5 * CHUNK_SIZE, pattern_fetcher(&calls))
            .unwrap();
        assert_eq!(
            calls.borrow().as_slice(),
            &[(0, 2 * CHUNK_SIZE), (3 * CHUNK_SIZE, 2 * CHUNK_SIZE)]
        );
    }

    #[test]
    fn out_of_range_reads_are_usage_errors() {
        let mut view = MemoryView::new();
        let mut no_fetch = |_: u32, _: u32| -> Result<Vec<u8>> { panic!("must not fetch") };

        assert!(matches!(
            view.read_with(REGION_SIZE - 10, 11, &mut no_fetch),
            Err(Error::Usage(_))
        ));
        assert!(matches!(
            view.read_with(u32::MAX, 2, &mut no_fetch),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn invalidate_forces_refetch() {
        let calls = RefCell::new(Vec::new());
        let mut view = MemoryView::new();

        view.read_with(0, CHUNK_SIZE, pattern_fetcher(&calls)).unwrap();
        view.invalidate(10, 4);
        view.read_with(0, CHUNK_SIZE, pattern_fetcher(&calls)).unwrap();
        assert_eq!(calls.borrow().len(), 2);
    }

    #[test]
    fn image_backed_view_never_fetches() {
        let image: Vec<u8> = (0..4096u32).map(|i| (i % 199) as u8).collect();
        let mut view = MemoryView::from_image(&image).unwrap();
        let mut no_fetch = |_: u32, _: u32| -> Result<Vec<u8>> {
            Err(Error::Usage("offset beyond the loaded image".to_string()))
        };

        let bytes = view.read_with(16, 64, &mut no_fetch).unwrap();
        assert_eq!(bytes, &image[16..80]);

        // Past the image the fetch closure decides.
        assert!(view.read_with(8192, 16, &mut no_fetch).is_err());
    }
}

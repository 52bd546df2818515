//! Page-granular allocator for memory above the HMA.
//!
//! Every 4 KiB page of guest RAM carries one link word: `0` marks a free page, `-1` terminates a
//! chain and any positive value names the next page of the same allocation. A [`MemHandle`] is
//! the first page of a chain, so a handle's physical base address is simply `page * 4096`.

/// Size of one allocator page.
pub const PAGE_SIZE: u32 = 4096;

/// First page handed out by the allocator (1 MiB + 64 KiB); everything below belongs to real
/// mode memory and the HMA.
pub const XMS_START: usize = 0x110;

const LINK_FREE: i32 = 0;
const LINK_END: i32 = -1;

/// Pages per megabyte.
const MB_PAGES: usize = 256;

/// First page of an allocation chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemHandle(u32);

impl MemHandle {
    /// Builds a handle from a raw page number. Page 0 is never a valid chain start.
    pub const fn from_page(page: u32) -> Option<Self> {
        if page == 0 {
            None
        } else {
            Some(Self(page))
        }
    }

    pub const fn page(self) -> u32 {
        self.0
    }

    /// Physical address of the first byte of the chain's first page.
    pub const fn base(self) -> u32 {
        self.0 * PAGE_SIZE
    }
}

/// Outcome of a successful [`PageAllocator::reallocate_pages`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reallocation {
    /// The chain already had the requested size.
    Unchanged,
    /// The chain was truncated or extended without moving its first page.
    Resized,
    /// A contiguous chain could not grow in place; a new chain was allocated and the old one
    /// released. The caller owns copying `pages` pages of contents from `from` to the new handle.
    Moved { from: MemHandle, pages: usize },
    /// A request for zero pages released the chain.
    Released,
}

#[derive(Debug, Clone)]
pub struct PageAllocator {
    links: Vec<i32>,
}

impl PageAllocator {
    pub fn new(total_pages: usize) -> Self {
        Self {
            links: vec![LINK_FREE; total_pages],
        }
    }

    /// Rebuilds an allocator from a saved link table.
    pub fn from_links(links: Vec<i32>) -> Self {
        Self { links }
    }

    pub fn links(&self) -> &[i32] {
        &self.links
    }

    pub fn total_pages(&self) -> usize {
        self.links.len()
    }

    #[inline]
    fn is_free(&self, page: usize) -> bool {
        self.links[page] == LINK_FREE
    }

    /// Whether `page` currently belongs to some chain.
    pub fn is_allocated(&self, page: usize) -> bool {
        page < self.links.len() && !self.is_free(page)
    }

    pub fn free_total(&self) -> usize {
        (XMS_START.min(self.links.len())..self.links.len())
            .filter(|&p| self.is_free(p))
            .count()
    }

    pub fn free_largest(&self) -> usize {
        let mut run = 0usize;
        let mut largest = 0usize;
        for page in XMS_START.min(self.links.len())..self.links.len() {
            if self.is_free(page) {
                run += 1;
            } else {
                largest = largest.max(run);
                run = 0;
            }
        }
        largest.max(run)
    }

    /// Number of pages in the chain starting at `handle`.
    pub fn allocated_pages(&self, handle: MemHandle) -> usize {
        self.chain(handle).count()
    }

    /// Iterates the pages of a chain in order.
    pub fn chain(&self, handle: MemHandle) -> impl Iterator<Item = u32> + '_ {
        let mut next = handle.page() as i32;
        core::iter::from_fn(move || {
            if next <= 0 || next as usize >= self.links.len() {
                return None;
            }
            let page = next as u32;
            next = self.links[page as usize];
            Some(page)
        })
    }

    /// Finds the start of a free run of at least `size` pages.
    ///
    /// An exact fit is returned immediately; otherwise the smallest larger run wins, with the
    /// trailing run considered last.
    fn best_match(&self, size: usize) -> Option<usize> {
        let end = self.links.len();
        let mut first: Option<usize> = None;
        let mut best = usize::MAX;
        let mut best_first = None;
        for index in XMS_START.min(end)..end {
            match first {
                None => {
                    if self.is_free(index) {
                        first = Some(index);
                    }
                }
                Some(start) => {
                    if !self.is_free(index) {
                        let pages = index - start;
                        if pages == size {
                            return Some(start);
                        } else if pages > size && pages < best {
                            best = pages;
                            best_first = Some(start);
                        }
                        first = None;
                    }
                }
            }
        }
        if let Some(start) = first {
            let pages = end - start;
            if pages >= size && pages < best {
                return Some(start);
            }
        }
        best_first
    }

    fn link_run(&mut self, start: usize, pages: usize) {
        for page in start..start + pages - 1 {
            self.links[page] = page as i32 + 1;
        }
        self.links[start + pages - 1] = LINK_END;
    }

    /// Allocates `pages` pages.
    ///
    /// With `sequence` the pages form a single physically contiguous run; otherwise the chain is
    /// assembled from successive best-fit runs. Returns `None` for zero pages or when the
    /// request cannot be satisfied.
    pub fn allocate_pages(&mut self, pages: usize, sequence: bool) -> Option<MemHandle> {
        if pages == 0 {
            return None;
        }
        if sequence {
            let start = self.best_match(pages)?;
            self.link_run(start, pages);
            return MemHandle::from_page(start as u32);
        }

        if self.free_total() < pages {
            return None;
        }
        let mut remaining = pages;
        let mut head: Option<usize> = None;
        let mut tail: Option<usize> = None;
        while remaining > 0 {
            // `free_total` guaranteed enough pages, so a free page always exists here.
            let mut index = self.best_match(1)?;
            while remaining > 0 && index < self.links.len() && self.is_free(index) {
                match tail {
                    Some(t) => self.links[t] = index as i32,
                    None => head = Some(index),
                }
                self.links[index] = LINK_END;
                tail = Some(index);
                index += 1;
                remaining -= 1;
            }
        }
        head.and_then(|h| MemHandle::from_page(h as u32))
    }

    /// Allocates a contiguous run that lies entirely inside one even-numbered megabyte, so the
    /// run's addresses are unaffected by the state of the A20 gate.
    pub fn allocate_pages_in_even_megabyte(&mut self, pages: usize) -> Option<MemHandle> {
        if pages == 0 || pages > MB_PAGES {
            return None;
        }
        let end = self.links.len();
        let mut mb = 0usize;
        while mb * MB_PAGES < end {
            let lo = (mb * MB_PAGES).max(XMS_START);
            let hi = ((mb + 1) * MB_PAGES).min(end);
            let mut run = 0usize;
            for page in lo..hi {
                if self.is_free(page) {
                    run += 1;
                    if run == pages {
                        let start = page + 1 - pages;
                        self.link_run(start, pages);
                        return MemHandle::from_page(start as u32);
                    }
                } else {
                    run = 0;
                }
            }
            mb += 2;
        }
        None
    }

    /// Returns the page the next single-page allocation would use, without claiming it.
    pub fn next_free_page(&self) -> Option<u32> {
        self.best_match(1).map(|p| p as u32)
    }

    pub fn release_pages(&mut self, handle: MemHandle) {
        let mut next = handle.page() as i32;
        while next > 0 && (next as usize) < self.links.len() {
            let page = next as usize;
            next = self.links[page];
            self.links[page] = LINK_FREE;
        }
    }

    /// Resizes the chain held in `handle`.
    ///
    /// An empty handle is allocated fresh; a request for zero pages releases the chain and
    /// empties the handle. Returns `None` if growing failed, in which case the chain is left
    /// untouched.
    pub fn reallocate_pages(
        &mut self,
        handle: &mut Option<MemHandle>,
        pages: usize,
        sequence: bool,
    ) -> Option<Reallocation> {
        let Some(current) = *handle else {
            if pages == 0 {
                return Some(Reallocation::Unchanged);
            }
            *handle = Some(self.allocate_pages(pages, sequence)?);
            return Some(Reallocation::Resized);
        };
        if pages == 0 {
            self.release_pages(current);
            *handle = None;
            return Some(Reallocation::Released);
        }

        let chain: Vec<u32> = self.chain(current).collect();
        let old_pages = chain.len();
        if old_pages == pages {
            return Some(Reallocation::Unchanged);
        }
        if old_pages > pages {
            let new_last = chain[pages - 1] as usize;
            self.links[new_last] = LINK_END;
            for &page in &chain[pages..] {
                self.links[page as usize] = LINK_FREE;
            }
            return Some(Reallocation::Resized);
        }

        let need = pages - old_pages;
        let last = *chain.last()? as usize;
        if sequence {
            let free_after = (last + 1..self.links.len())
                .take_while(|&p| self.is_free(p))
                .count();
            if free_after >= need {
                for page in last..last + need {
                    self.links[page] = page as i32 + 1;
                }
                self.links[last + need] = LINK_END;
                return Some(Reallocation::Resized);
            }
            let moved = self.allocate_pages(pages, true)?;
            self.release_pages(current);
            *handle = Some(moved);
            Some(Reallocation::Moved {
                from: current,
                pages: old_pages,
            })
        } else {
            let rest = self.allocate_pages(need, false)?;
            self.links[last] = rest.page() as i32;
            Some(Reallocation::Resized)
        }
    }

    /// Raw link word following `handle` (`-1` at the end of a chain).
    pub fn next_handle(&self, handle: MemHandle) -> i32 {
        self.links
            .get(handle.page() as usize)
            .copied()
            .unwrap_or(LINK_END)
    }

    /// The page `n` links after `handle`, or `None` if the chain is shorter.
    pub fn next_handle_at(&self, handle: MemHandle, n: usize) -> Option<MemHandle> {
        self.chain(handle)
            .nth(n)
            .and_then(MemHandle::from_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(mb: usize) -> PageAllocator {
        PageAllocator::new(mb * MB_PAGES)
    }

    #[test]
    fn pages_below_xms_start_are_never_handed_out() {
        let mut a = alloc(2);
        let h = a.allocate_pages(1, true).unwrap();
        assert_eq!(h.page() as usize, XMS_START);
        assert_eq!(a.free_total(), 2 * MB_PAGES - XMS_START - 1);
    }

    #[test]
    fn best_match_prefers_exact_fit_over_first_fit() {
        let mut a = alloc(2);
        let h1 = a.allocate_pages(4, true).unwrap();
        let _h2 = a.allocate_pages(1, true).unwrap();
        let h3 = a.allocate_pages(2, true).unwrap();
        let _h4 = a.allocate_pages(1, true).unwrap();
        a.release_pages(h1);
        a.release_pages(h3);

        // Holes: 4 pages at XMS_START, 2 pages after it, and the tail.
        let exact = a.allocate_pages(2, true).unwrap();
        assert_eq!(exact, h3);
        let smaller_larger = a.allocate_pages(3, true).unwrap();
        assert_eq!(smaller_larger, h1);
    }

    #[test]
    fn scattered_allocation_chains_runs() {
        let mut a = alloc(2);
        let h1 = a.allocate_pages(2, true).unwrap();
        let _hold = a.allocate_pages(1, true).unwrap();
        a.release_pages(h1);

        let h = a.allocate_pages(4, false).unwrap();
        let pages: Vec<u32> = a.chain(h).collect();
        assert_eq!(pages.len(), 4);
        assert_eq!(pages[0], h1.page());
        assert_eq!(pages[1], h1.page() + 1);
        assert_ne!(pages[2], h1.page() + 2, "the held page must be skipped");
    }

    #[test]
    fn allocation_fails_without_touching_state() {
        let mut a = alloc(2);
        let before = a.links().to_vec();
        assert!(a.allocate_pages(0, true).is_none());
        assert!(a.allocate_pages(10_000, true).is_none());
        assert!(a.allocate_pages(10_000, false).is_none());
        assert_eq!(a.links(), &before[..]);
    }

    #[test]
    fn reallocate_shrinks_and_grows_in_place() {
        let mut a = alloc(2);
        let mut h = a.allocate_pages(8, true);
        let start = h.unwrap();
        assert_eq!(
            a.reallocate_pages(&mut h, 3, true),
            Some(Reallocation::Resized)
        );
        assert_eq!(a.allocated_pages(start), 3);
        assert_eq!(
            a.reallocate_pages(&mut h, 6, true),
            Some(Reallocation::Resized)
        );
        assert_eq!(h, Some(start));
        assert_eq!(a.allocated_pages(start), 6);
        assert_eq!(
            a.reallocate_pages(&mut h, 6, true),
            Some(Reallocation::Unchanged)
        );
    }

    #[test]
    fn reallocate_moves_when_blocked() {
        let mut a = alloc(2);
        let mut h = a.allocate_pages(2, true);
        let old = h.unwrap();
        let _blocker = a.allocate_pages(1, true).unwrap();
        let r = a.reallocate_pages(&mut h, 4, true).unwrap();
        assert_eq!(r, Reallocation::Moved { from: old, pages: 2 });
        assert_ne!(h, Some(old));
        assert!(!a.is_allocated(old.page() as usize));
    }

    #[test]
    fn reallocate_to_zero_releases() {
        let mut a = alloc(2);
        let free = a.free_total();
        let mut h = a.allocate_pages(5, false);
        assert_eq!(
            a.reallocate_pages(&mut h, 0, false),
            Some(Reallocation::Released)
        );
        assert_eq!(h, None);
        assert_eq!(a.free_total(), free);
    }

    #[test]
    fn even_megabyte_allocation_skips_odd_megabytes() {
        let mut a = alloc(4);
        // Megabyte 0 ends below XMS_START, so the first candidate is megabyte 2.
        let h = a.allocate_pages_in_even_megabyte(24).unwrap();
        assert_eq!(h.page() as usize, 2 * MB_PAGES);
        assert_eq!(a.allocated_pages(h), 24);
    }

    #[test]
    fn next_handle_walks_the_chain() {
        let mut a = alloc(2);
        let h = a.allocate_pages(3, true).unwrap();
        assert_eq!(a.next_handle(h), h.page() as i32 + 1);
        assert_eq!(
            a.next_handle_at(h, 2),
            MemHandle::from_page(h.page() + 2)
        );
        assert_eq!(a.next_handle_at(h, 3), None);
        assert_eq!(a.next_free_page(), Some(h.page() + 3));
    }
}

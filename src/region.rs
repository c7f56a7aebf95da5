use std::io;
use std::ptr;
use std::slice;

use anyhow::bail;
use anyhow::Result;

use crate::content::ReferenceContent;

/// Which half of the region currently holds the zero fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroHalf {
    Lower,
    Upper,
}

impl ZeroHalf {
    fn flipped(self) -> Self {
        match self {
            ZeroHalf::Lower => ZeroHalf::Upper,
            ZeroHalf::Upper => ZeroHalf::Lower,
        }
    }
}

/// A private anonymous mapping split into two halves: one all zeros, the
/// other tiled with whole copies of the reference content. The assignment
/// swaps on every churn so the kernel has to re-scan and re-merge the
/// relocated pages.
///
/// Bytes past the last whole tile in the content half stay unwritten and
/// are never verified.
pub struct MergeableRegion {
    base: *mut u8,
    sz: usize,
    half: usize,
    ncopies: usize,
    zero_half: ZeroHalf,
    content: ReferenceContent,
}

impl MergeableRegion {
    /// Map and fill a region of `mem_mb` megabytes.
    pub fn map(mem_mb: usize, content: ReferenceContent) -> Result<Self> {
        Self::map_sized(mem_mb * 1_000_000, content)
    }

    fn map_sized(sz: usize, content: ReferenceContent) -> Result<Self> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                sz,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            bail!(
                "mmap of {} bytes failed: {}",
                sz,
                io::Error::last_os_error()
            );
        }

        let half = sz / 2;
        let mut region = Self {
            base: base as *mut u8,
            sz,
            half,
            ncopies: half / content.len(),
            zero_half: ZeroHalf::Lower,
            content,
        };
        region.write_epoch();
        Ok(region)
    }

    /// Ask the kernel to consider the whole region for page deduplication.
    pub fn advise_mergeable(&self) -> Result<()> {
        let ret = unsafe {
            libc::madvise(self.base as *mut libc::c_void, self.sz, libc::MADV_MERGEABLE)
        };
        if ret != 0 {
            bail!(
                "madvise(MADV_MERGEABLE) failed: {}",
                io::Error::last_os_error()
            );
        }
        Ok(())
    }

    /// Rewrite both halves to match the current zero/content assignment.
    fn write_epoch(&mut self) {
        let filler = self.content.as_slice();
        let filesize = filler.len();

        // The slices alias self.base, not the struct fields, so the filler
        // borrow above stays legal.
        let whole = unsafe { slice::from_raw_parts_mut(self.base, self.sz) };
        let (lower, upper) = whole.split_at_mut(self.half);
        let (zeros, tiles) = match self.zero_half {
            ZeroHalf::Lower => (lower, upper),
            ZeroHalf::Upper => (upper, lower),
        };

        zeros.fill(0);
        for i in 0..self.ncopies {
            tiles[i * filesize..(i + 1) * filesize].copy_from_slice(filler);
        }
    }

    /// Swap which half holds zeros and rewrite accordingly.
    pub fn churn(&mut self) {
        self.zero_half = self.zero_half.flipped();
        self.write_epoch();
    }

    /// Check every byte written in the previous epoch. An error here is the
    /// primary "test failed" signal and carries the exact offending offset.
    pub fn verify(&self) -> Result<()> {
        let whole = unsafe { slice::from_raw_parts(self.base as *const u8, self.sz) };
        let (lower, upper) = whole.split_at(self.half);
        let (zeros, tiles, zero_off, tile_off) = match self.zero_half {
            ZeroHalf::Lower => (lower, upper, 0, self.half),
            ZeroHalf::Upper => (upper, lower, self.half, 0),
        };

        if let Some(pos) = zeros.iter().position(|&b| b != 0) {
            bail!(
                "corruption: region byte {} is not 0 (found {:#04x})",
                zero_off + pos,
                zeros[pos]
            );
        }

        let filler = self.content.as_slice();
        let filesize = filler.len();
        for i in 0..self.ncopies {
            let start = i * filesize;
            if &tiles[start..start + filesize] != filler {
                bail!(
                    "corruption: content tile {} mismatch at region bytes {}..{}",
                    i,
                    tile_off + start,
                    tile_off + start + filesize - 1
                );
            }
        }
        Ok(())
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.sz
    }

    pub fn ncopies(&self) -> usize {
        self.ncopies
    }

    pub fn zero_half(&self) -> ZeroHalf {
        self.zero_half
    }

    #[cfg(test)]
    fn poke(&mut self, offset: usize, val: u8) {
        assert!(offset < self.sz);
        unsafe { *self.base.add(offset) = val };
    }
}

impl Drop for MergeableRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.sz);
        }
    }
}

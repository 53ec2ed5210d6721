//! Recording file with page-cache control: continuous recording must not
//! evict the rest of the system's cache, so written ranges are dropped
//! behind the write pointer and reads keep a bounded, self-tuning
//! read-ahead window.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Writes are flushed out of the cache once this much has accumulated.
const WRITE_BUFFER: u64 = 800 * 1024;
/// Second-stage flush interval for pages the first pass left dirty.
const TOTWRITTEN_FLUSH: u64 = 32 * 1024 * 1024;
/// fadvise granularity (page size).
const FADVGRAN: u64 = 4096;
/// Cached-window chunk retained around the read position.
const READ_CHUNK: u64 = 8 * 1024 * 1024;

pub struct FadviseFile {
    file:         File,
    curpos:       u64,
    begin:        u64,
    lastpos:      u64,
    ahead:        u64,
    cached_start: u64,
    cached_end:   u64,
    readahead:    usize,
    written:      u64,
    totwritten:   u64,
}

impl FadviseFile {
    /// Creates (truncating) a file for writing.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        Ok(Self::with_file(file))
    }

    /// Opens an existing file for reading.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::with_file(File::open(path)?))
    }

    fn with_file(file: File) -> Self {
        let f = Self {
            file,
            curpos: 0,
            begin: 0,
            lastpos: 0,
            ahead: 0,
            cached_start: 0,
            cached_end: 0,
            readahead: 128 * 1024,
            written: 0,
            totwritten: 0,
        };
        // we do our own read-ahead, disable the kernel one
        f.fadvise_random();
        f
    }

    /// Initial size of the read-ahead window.
    pub fn set_read_ahead(&mut self, bytes: usize) {
        self.readahead = bytes;
    }

    pub fn position(&self) -> u64 {
        self.curpos
    }

    pub fn seek(&mut self, offset: u64) -> io::Result<u64> {
        if offset == self.curpos {
            return Ok(self.curpos);
        }
        self.curpos = self.file.seek(SeekFrom::Start(offset))?;
        Ok(self.curpos)
    }

    /// Writes all of `data`; a short write surfaces as an error.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.begin = self.begin.min(self.curpos);
        self.curpos += data.len() as u64;
        self.written += data.len() as u64;
        self.lastpos = self.lastpos.max(self.curpos);
        if self.written > WRITE_BUFFER {
            if self.lastpos > self.begin {
                // start writeback of the window and drop what the
                // previous pass already wrote back
                let headdrop = self.begin.min(WRITE_BUFFER * 2);
                self.fadvise_drop(self.begin - headdrop, self.lastpos - self.begin + headdrop);
            }
            self.begin = self.curpos;
            self.lastpos = self.curpos;
            self.totwritten += self.written;
            self.written = 0;
            // when writing faster than the disk drains, pages can still
            // be dirty on the first pass; sweep them at larger intervals
            if self.totwritten > TOTWRITTEN_FLUSH {
                let headdrop = (self.curpos - self.totwritten).min(self.totwritten * 2);
                self.fadvise_drop(
                    self.curpos - self.totwritten - headdrop,
                    self.totwritten + headdrop,
                );
                self.totwritten = 0;
            }
        }
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // nonzero means the caller seeked since the last read
        let jumped = self.curpos as i64 - self.lastpos as i64;
        if self.cached_start < self.cached_end
            && (self.curpos < self.cached_start || self.curpos > self.cached_end)
        {
            // current position is outside the cached window: invalidate it
            self.fadvise_drop(self.cached_start, self.cached_end - self.cached_start);
            self.cached_start = self.curpos;
            self.cached_end = self.curpos;
        }
        self.cached_start = self.cached_start.min(self.curpos);

        let n = self.file.read(buf)?;
        if n > 0 {
            self.curpos += n as u64;
            self.cached_end = self.cached_end.max(self.curpos);

            if jumped >= 0 && jumped <= self.readahead as i64 {
                // contiguous (or small forward) access: keep the window
                // ahead of the reader, re-arming once half is used up
                if self.ahead.saturating_sub(self.curpos) < (self.readahead / 2) as u64 {
                    self.fadvise_willneed(self.curpos, self.readahead as u64);
                    self.ahead = self.curpos + self.readahead as u64;
                    self.cached_end = self.cached_end.max(self.ahead);
                }
                if self.readahead < buf.len() * 32 {
                    self.readahead = buf.len() * 32;
                }
            } else {
                // collapse after a seek
                self.ahead = self.curpos;
            }

            if self.cached_start < self.cached_end {
                if self.curpos.saturating_sub(self.cached_start) > READ_CHUNK * 2 {
                    // moved forward enough: shrink the tail window
                    self.fadvise_drop(
                        self.cached_start,
                        self.curpos - READ_CHUNK - self.cached_start,
                    );
                    self.cached_start = self.curpos - READ_CHUNK;
                } else if self.cached_end > self.ahead
                    && self.cached_end.saturating_sub(self.curpos) > READ_CHUNK * 2
                {
                    // moved back enough: shrink the head window
                    self.fadvise_drop(
                        self.curpos + READ_CHUNK,
                        self.cached_end - (self.curpos + READ_CHUNK),
                    );
                    self.cached_end = self.curpos + READ_CHUNK;
                }
            }
        }
        self.lastpos = self.curpos;
        Ok(n)
    }

    #[cfg(target_os = "linux")]
    fn raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.file.as_raw_fd()
    }

    #[cfg(target_os = "linux")]
    fn fadvise_random(&self) {
        unsafe {
            libc::posix_fadvise(self.raw_fd(), 0, 0, libc::POSIX_FADV_RANDOM);
        }
    }

    #[cfg(target_os = "linux")]
    fn fadvise_drop(&self, offset: u64, len: u64) {
        // widen to page granularity so partial pages get freed too
        let offset = offset.saturating_sub(FADVGRAN - 1);
        let len = len + (FADVGRAN - 1) * 2;
        unsafe {
            libc::posix_fadvise(
                self.raw_fd(),
                offset as libc::off_t,
                len as libc::off_t,
                libc::POSIX_FADV_DONTNEED,
            );
        }
    }

    #[cfg(target_os = "linux")]
    fn fadvise_willneed(&self, offset: u64, len: u64) {
        unsafe {
            libc::posix_fadvise(
                self.raw_fd(),
                offset as libc::off_t,
                len as libc::off_t,
                libc::POSIX_FADV_WILLNEED,
            );
        }
    }

    #[cfg(target_os = "linux")]
    fn fadvise_drop_all(&self) {
        unsafe {
            // len 0 means to the end of the file
            libc::posix_fadvise(self.raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn fadvise_random(&self) {}
    #[cfg(not(target_os = "linux"))]
    fn fadvise_drop(&self, _offset: u64, _len: u64) {}
    #[cfg(not(target_os = "linux"))]
    fn fadvise_willneed(&self, _offset: u64, _len: u64) {}
    #[cfg(not(target_os = "linux"))]
    fn fadvise_drop_all(&self) {}
}

impl Drop for FadviseFile {
    fn drop(&mut self) {
        if self.totwritten > 0 || self.written > 0 {
            // last chance to un-cache the data: it has to be on disk first
            let _ = self.file.sync_data();
        }
        self.fadvise_drop_all();
    }
}

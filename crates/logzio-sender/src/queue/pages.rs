// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only page files backing the disk queue.
//!
//! # Layout
//!
//! ```text
//! <dir>/cursor                  16 bytes: head page (u64 LE), head offset (u64 LE)
//! <dir>/page-0000000000000000.dat
//! <dir>/page-0000000000000001.dat
//! ...
//! ```
//!
//! Each page is a sequence of frames: a `u32` little-endian length followed by the
//! record bytes. Records are appended to the tail page; once a frame would push
//! the tail page past `page_size` a new page is started. Page ids are
//! consecutive.
//!
//! The read position (head) is persisted to `cursor` after every dequeue. The
//! write position (tail) is recovered on open by scanning the last page, and a
//! frame torn by a crash is truncated away.
//!
//! [`PageStore`] is not synchronized; the disk queue wraps it in a mutex.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

const CURSOR_FILE: &str = "cursor";
const PAGE_PREFIX: &str = "page-";
const PAGE_SUFFIX: &str = ".dat";
const FRAME_HEADER_BYTES: u64 = 4;

/// A byte position inside a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub page: u64,
    pub offset: u64,
}

#[derive(Debug)]
pub struct PageStore {
    dir: PathBuf,
    page_size: u64,
    cursor: File,
    head: Position,
    /// Length of the head page once it is no longer the tail page
    head_end: Option<u64>,
    reader: Option<File>,
    tail: Position,
    writer: File,
    /// A failed write may have left a partial frame past `tail.offset`
    torn_tail: bool,
    len: usize,
    /// Number of upcoming frame writes to cut short with an error
    #[cfg(test)]
    pub(crate) fail_writes: usize,
}

impl PageStore {
    /// Opens (or creates) the page store in `dir`.
    pub fn open(dir: &Path, page_size: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;

        let mut pages = list_pages(dir)?;
        let stored_head = read_cursor(&dir.join(CURSOR_FILE))?;

        let tail = match pages.last() {
            Some(&last) => {
                let path = page_path(dir, last);
                let (_, valid_end) = scan_page(&path, 0)?;
                let file_len = fs::metadata(&path)?.len();
                if valid_end < file_len {
                    warn!(
                        "Truncating torn record at the end of {} ({} bytes dropped)",
                        path.display(),
                        file_len - valid_end
                    );
                    OpenOptions::new().write(true).open(&path)?.set_len(valid_end)?;
                }
                Position {
                    page: last,
                    offset: valid_end,
                }
            }
            None => {
                let page = stored_head.map_or(0, |head| head.page);
                pages.push(page);
                Position { page, offset: 0 }
            }
        };

        let first = pages.first().copied().unwrap_or(tail.page);
        let head = match stored_head {
            Some(head) if head > tail => tail,
            Some(head) if head.page < first => Position {
                page: first,
                offset: 0,
            },
            Some(head) => head,
            None => Position {
                page: first,
                offset: 0,
            },
        };

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(page_path(dir, tail.page))?;
        let cursor = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(dir.join(CURSOR_FILE))?;

        let mut store = PageStore {
            dir: dir.to_path_buf(),
            page_size,
            cursor,
            head,
            head_end: None,
            reader: None,
            tail,
            writer,
            torn_tail: false,
            len: 0,
            #[cfg(test)]
            fail_writes: 0,
        };
        store.len = store.count_records()?;
        store.write_cursor()?;
        store.gc()?;

        debug!(
            "Opened disk queue in {} with {} records (head {:?}, tail {:?})",
            dir.display(),
            store.len,
            store.head,
            store.tail
        );
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Position {
        self.head
    }

    pub fn tail(&self) -> Position {
        self.tail
    }

    /// Appends one record to the tail page.
    ///
    /// A failed write leaves the page as it was before the call.
    pub fn append(&mut self, record: &[u8]) -> io::Result<()> {
        let len = u32::try_from(record.len())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "record larger than 4 GiB"))?;
        let frame_len = FRAME_HEADER_BYTES + u64::from(len);

        self.repair_tail()?;

        if self.tail.offset > 0 && self.tail.offset + frame_len > self.page_size {
            self.roll()?;
        }

        let mut frame = Vec::with_capacity(record.len() + 4);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(record);
        if let Err(e) = self.write_frame(&frame) {
            self.torn_tail = true;
            if let Err(repair) = self.repair_tail() {
                warn!(
                    "Could not cut partial record from disk queue page {}: {}",
                    self.tail.page, repair
                );
            }
            return Err(e);
        }

        self.tail.offset += frame_len;
        self.len += 1;
        Ok(())
    }

    /// Reads and consumes the oldest record.
    pub fn pop(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if self.head >= self.tail {
                return Ok(None);
            }

            let end = self.head_end()?;
            if self.head.offset >= end {
                self.advance_page();
                continue;
            }

            let offset = self.head.offset;
            let reader = self.reader()?;
            let mut header = [0u8; 4];
            reader.read_exact(&mut header)?;
            let len = u64::from(u32::from_le_bytes(header));
            if offset + FRAME_HEADER_BYTES + len > end {
                // Unreadable frame: skip whatever is left of this page
                let page = self.head.page;
                self.head.offset = end;
                self.reader = None;
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("corrupt record in disk queue page {page}"),
                ));
            }

            let mut record = vec![0u8; len as usize];
            reader.read_exact(&mut record)?;
            self.head.offset += FRAME_HEADER_BYTES + len;
            self.len = self.len.saturating_sub(1);
            self.write_cursor()?;
            return Ok(Some(record));
        }
    }

    /// Deletes pages the head has moved past and syncs the cursor.
    pub fn gc(&mut self) -> io::Result<usize> {
        let mut removed = 0;
        for page in list_pages(&self.dir)? {
            if page < self.head.page {
                fs::remove_file(page_path(&self.dir, page))?;
                removed += 1;
            }
        }
        self.cursor.sync_data()?;
        if removed > 0 {
            debug!("Removed {} consumed disk queue pages", removed);
        }
        Ok(removed)
    }

    /// Drops every record and every page, starting over on a fresh page.
    pub fn clear(&mut self) -> io::Result<()> {
        self.reader = None;
        for page in list_pages(&self.dir)? {
            fs::remove_file(page_path(&self.dir, page))?;
        }
        let page = self.tail.page + 1;
        self.writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(page_path(&self.dir, page))?;
        self.tail = Position { page, offset: 0 };
        self.head = self.tail;
        self.head_end = None;
        self.len = 0;
        self.write_cursor()
    }

    /// Flushes the tail page and the cursor to stable storage.
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.sync_data()?;
        self.write_cursor()?;
        self.cursor.sync_data()
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            self.writer.write_all(&frame[..frame.len() / 2])?;
            return Err(io::Error::other("no space left on device"));
        }
        self.writer.write_all(frame)
    }

    /// Drops bytes a failed write left past the tail position.
    fn repair_tail(&mut self) -> io::Result<()> {
        if self.torn_tail {
            self.writer.set_len(self.tail.offset)?;
            self.torn_tail = false;
        }
        Ok(())
    }

    fn roll(&mut self) -> io::Result<()> {
        self.writer.sync_data()?;
        let page = self.tail.page + 1;
        self.writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(page_path(&self.dir, page))?;
        self.tail = Position { page, offset: 0 };
        Ok(())
    }

    fn head_end(&mut self) -> io::Result<u64> {
        if self.head.page == self.tail.page {
            return Ok(self.tail.offset);
        }
        if let Some(end) = self.head_end {
            return Ok(end);
        }
        let end = match fs::metadata(page_path(&self.dir, self.head.page)) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        self.head_end = Some(end);
        Ok(end)
    }

    fn advance_page(&mut self) {
        self.head = Position {
            page: self.head.page + 1,
            offset: 0,
        };
        self.head_end = None;
        self.reader = None;
    }

    fn reader(&mut self) -> io::Result<&mut File> {
        if self.reader.is_none() {
            let mut file = File::open(page_path(&self.dir, self.head.page))?;
            file.seek(SeekFrom::Start(self.head.offset))?;
            self.reader = Some(file);
        }
        self.reader
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "disk queue page is not open"))
    }

    fn write_cursor(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.head.page.to_le_bytes());
        buf[8..].copy_from_slice(&self.head.offset.to_le_bytes());
        self.cursor.seek(SeekFrom::Start(0))?;
        self.cursor.write_all(&buf)
    }

    fn count_records(&self) -> io::Result<usize> {
        let mut count = 0;
        for page in self.head.page..=self.tail.page {
            let path = page_path(&self.dir, page);
            if !path.exists() {
                continue;
            }
            let start = if page == self.head.page {
                self.head.offset
            } else {
                0
            };
            count += scan_page(&path, start)?.0;
        }
        Ok(count)
    }
}

fn page_path(dir: &Path, page: u64) -> PathBuf {
    dir.join(format!("{PAGE_PREFIX}{page:016x}{PAGE_SUFFIX}"))
}

/// Ids of the page files in `dir`, ascending.
fn list_pages(dir: &Path) -> io::Result<Vec<u64>> {
    let mut pages = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(id) = name
            .strip_prefix(PAGE_PREFIX)
            .and_then(|rest| rest.strip_suffix(PAGE_SUFFIX))
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        {
            pages.push(id);
        }
    }
    pages.sort_unstable();
    Ok(pages)
}

fn read_cursor(path: &Path) -> io::Result<Option<Position>> {
    let mut buf = [0u8; 16];
    match File::open(path) {
        Ok(mut file) => match file.read_exact(&mut buf) {
            Ok(()) => {
                let mut page = [0u8; 8];
                let mut offset = [0u8; 8];
                page.copy_from_slice(&buf[..8]);
                offset.copy_from_slice(&buf[8..]);
                Ok(Some(Position {
                    page: u64::from_le_bytes(page),
                    offset: u64::from_le_bytes(offset),
                }))
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Counts complete frames from `start`, returning the count and the end of the
/// last complete frame.
fn scan_page(path: &Path, start: u64) -> io::Result<(usize, u64)> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(start))?;

    let mut count = 0;
    let mut offset = start;
    let mut header = [0u8; 4];
    while offset + FRAME_HEADER_BYTES <= file_len {
        reader.read_exact(&mut header)?;
        let len = u64::from(u32::from_le_bytes(header));
        let next = offset + FRAME_HEADER_BYTES + len;
        if next > file_len {
            break;
        }
        reader.seek_relative(i64::try_from(len).unwrap_or(i64::MAX))?;
        offset = next;
        count += 1;
    }
    Ok((count, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pop_string(store: &mut PageStore) -> Option<String> {
        store
            .pop()
            .unwrap()
            .map(|record| String::from_utf8(record).unwrap())
    }

    #[test]
    fn test_append_and_pop() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path(), 1024).unwrap();

        store.append(b"first").unwrap();
        store.append(b"second").unwrap();
        assert_eq!(store.len(), 2);

        assert_eq!(pop_string(&mut store).as_deref(), Some("first"));
        assert_eq!(pop_string(&mut store).as_deref(), Some("second"));
        assert_eq!(pop_string(&mut store), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_failed_write_leaves_no_partial_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path(), 1024).unwrap();
        store.append(b"before").unwrap();
        let tail = store.tail();

        store.fail_writes = 1;
        assert!(store.append(b"lost to a full disk").is_err());
        assert_eq!(store.tail(), tail);
        assert_eq!(store.len(), 1);
        assert_eq!(
            fs::metadata(page_path(dir.path(), tail.page)).unwrap().len(),
            tail.offset
        );

        store.append(b"after").unwrap();
        assert_eq!(pop_string(&mut store).as_deref(), Some("before"));
        assert_eq!(pop_string(&mut store).as_deref(), Some("after"));
        assert_eq!(pop_string(&mut store), None);

        // Survives a reopen as well
        store.append(b"persisted").unwrap();
        drop(store);
        let mut reopened = PageStore::open(dir.path(), 1024).unwrap();
        assert_eq!(pop_string(&mut reopened).as_deref(), Some("persisted"));
    }

    #[test]
    fn test_rolls_pages_and_gc_removes_consumed() {
        let dir = tempfile::tempdir().unwrap();
        // 4 byte header + 12 byte record: two frames per page
        let mut store = PageStore::open(dir.path(), 32).unwrap();
        for i in 0..6 {
            store.append(format!("record-{i:05}").as_bytes()).unwrap();
        }
        assert_eq!(store.tail().page, 2);
        assert_eq!(list_pages(dir.path()).unwrap(), vec![0, 1, 2]);

        for i in 0..5 {
            assert_eq!(pop_string(&mut store), Some(format!("record-{i:05}")));
        }
        assert_eq!(store.gc().unwrap(), 2);
        assert_eq!(list_pages(dir.path()).unwrap(), vec![2]);
        assert_eq!(pop_string(&mut store), Some("record-00005".to_string()));
    }

    #[test]
    fn test_oversized_record_gets_its_own_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path(), 16).unwrap();
        store.append(b"tiny").unwrap();
        store.append(&[b'x'; 64]).unwrap();
        store.append(b"tiny").unwrap();
        assert_eq!(store.tail().page, 2);

        assert_eq!(store.pop().unwrap().unwrap(), b"tiny");
        assert_eq!(store.pop().unwrap().unwrap().len(), 64);
        assert_eq!(store.pop().unwrap().unwrap(), b"tiny");
    }

    #[test]
    fn test_reopen_preserves_unconsumed_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = PageStore::open(dir.path(), 64).unwrap();
            for i in 0..10 {
                store.append(format!("r{i}").as_bytes()).unwrap();
            }
            assert_eq!(pop_string(&mut store).as_deref(), Some("r0"));
            assert_eq!(pop_string(&mut store).as_deref(), Some("r1"));
            store.sync().unwrap();
        }

        let mut store = PageStore::open(dir.path(), 64).unwrap();
        assert_eq!(store.len(), 8);
        for i in 2..10 {
            assert_eq!(pop_string(&mut store), Some(format!("r{i}")));
        }
        assert_eq!(pop_string(&mut store), None);
    }

    #[test]
    fn test_reopen_truncates_torn_record() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = PageStore::open(dir.path(), 1024).unwrap();
            store.append(b"complete").unwrap();
        }
        // Header announcing 100 bytes followed by only 3
        let mut page = OpenOptions::new()
            .append(true)
            .open(page_path(dir.path(), 0))
            .unwrap();
        page.write_all(&100u32.to_le_bytes()).unwrap();
        page.write_all(b"abc").unwrap();
        drop(page);

        let mut store = PageStore::open(dir.path(), 1024).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.tail().offset, 4 + 8);
        store.append(b"after").unwrap();
        assert_eq!(pop_string(&mut store).as_deref(), Some("complete"));
        assert_eq!(pop_string(&mut store).as_deref(), Some("after"));
    }

    #[test]
    fn test_clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path(), 32).unwrap();
        for _ in 0..5 {
            store.append(b"0123456789").unwrap();
        }
        store.clear().unwrap();
        assert!(store.is_empty());
        assert_eq!(pop_string(&mut store), None);
        assert_eq!(list_pages(dir.path()).unwrap().len(), 1);

        store.append(b"fresh").unwrap();
        assert_eq!(pop_string(&mut store).as_deref(), Some("fresh"));
    }

    #[test]
    fn test_cursor_ahead_of_data_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = PageStore::open(dir.path(), 1024).unwrap();
            store.append(b"one").unwrap();
        }
        let mut buf = [0u8; 16];
        buf[8..].copy_from_slice(&9999u64.to_le_bytes());
        fs::write(dir.path().join(CURSOR_FILE), buf).unwrap();

        let mut store = PageStore::open(dir.path(), 1024).unwrap();
        assert!(store.is_empty());
        assert_eq!(pop_string(&mut store), None);
    }
}

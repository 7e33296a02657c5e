//! On-disk JWT cache: a 20-byte ASCII decimal count (zero-byte padded), a
//! newline at offset 20, then one token per line.
//!
//! Appends land before the header rewrite, so a crash in between leaves a
//! file whose line count exceeds the header. Readers trust the header, never
//! the line count.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

pub(crate) const HEADER_LEN: usize = 20;
const STREAM_CAPACITY: usize = 1_000_000;
const PRIME_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub(crate) struct JwtCache {
    file: File,
    path: PathBuf,
    count: u64,
}

impl JwtCache {
    /// Open or create the cache file and parse its header.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();
        if size == 0 {
            return Ok(JwtCache {
                file,
                path: path.to_path_buf(),
                count: 0,
            });
        }

        let mut header = [0u8; HEADER_LEN + 1];
        file.read_exact(&mut header).map_err(|_| {
            Error::CorruptCache(format!(
                "{}: header shorter than {} bytes",
                path.display(),
                HEADER_LEN
            ))
        })?;
        if header[HEADER_LEN] != b'\n' {
            return Err(Error::CorruptCache(format!(
                "{}: missing header terminator",
                path.display()
            )));
        }
        let count = parse_count(&header[..HEADER_LEN]).ok_or_else(|| {
            Error::CorruptCache(format!(
                "{}: header is not a decimal count",
                path.display()
            ))
        })?;

        let lines = count_token_lines(&mut file)?;
        if lines < count {
            return Err(Error::CorruptCache(format!(
                "{}: header says {} tokens, file holds {}",
                path.display(),
                count,
                lines
            )));
        }

        Ok(JwtCache {
            file,
            path: path.to_path_buf(),
            count,
        })
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    /// Append tokens at the tail, then rewrite the header. Fsyncs so a crash
    /// between the two writes stays recoverable.
    pub(crate) fn append(&mut self, tokens: &[String]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        let size = self.file.metadata()?.len();
        let pos = size.max((HEADER_LEN + 1) as u64);
        self.file.seek(SeekFrom::Start(pos))?;

        let mut buf = String::with_capacity(tokens.iter().map(|t| t.len() + 1).sum());
        for token in tokens {
            buf.push_str(token);
            buf.push('\n');
        }
        self.file.write_all(buf.as_bytes())?;

        let new_count = self.count + tokens.len() as u64;
        let mut header = [0u8; HEADER_LEN + 1];
        let digits = new_count.to_string();
        header[..digits.len()].copy_from_slice(digits.as_bytes());
        header[HEADER_LEN] = b'\n';
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_all()?;

        self.count = new_count;
        Ok(())
    }

    /// Stream `count` tokens in insertion order through a bounded channel.
    /// The file reader runs on a blocking thread; a short pause primes the
    /// queue so the first workers don't start against an empty channel.
    pub(crate) async fn read(
        &self,
        count: u64,
    ) -> Result<(async_channel::Receiver<String>, async_channel::Receiver<Error>)> {
        if count > self.count {
            return Err(Error::CorruptCache(format!(
                "{}: {} jwts requested but cache holds {}",
                self.path.display(),
                count,
                self.count
            )));
        }
        debug!(count, "streaming jwts from cache");

        let (tx, rx) = async_channel::bounded(STREAM_CAPACITY);
        let (err_tx, err_rx) = async_channel::bounded(1);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || retrieve(path, count, tx, err_tx));
        tokio::time::sleep(PRIME_DELAY).await;
        Ok((rx, err_rx))
    }
}

fn retrieve(
    path: PathBuf,
    count: u64,
    tx: async_channel::Sender<String>,
    err_tx: async_channel::Sender<Error>,
) {
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            let _ = err_tx.send_blocking(e.into());
            return;
        }
    };
    let mut reader = BufReader::new(file);

    // first line is the count header, not a token
    let mut line = String::new();
    if let Err(e) = reader.read_line(&mut line) {
        let _ = err_tx.send_blocking(e.into());
        return;
    }

    let mut sent = 0u64;
    while sent < count {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                let _ = err_tx.send_blocking(Error::CorruptCache(format!(
                    "{}: ran out of tokens after {}",
                    path.display(),
                    sent
                )));
                return;
            }
            Ok(_) => {
                // receivers dropped means the run is over
                if tx.send_blocking(line.trim_end().to_string()).is_err() {
                    return;
                }
                sent += 1;
            }
            Err(e) => {
                let _ = err_tx.send_blocking(e.into());
                return;
            }
        }
    }
}

/// Decimal digits terminated by zero-byte padding; anything else (legacy
/// binary headers included) is corrupt.
fn parse_count(header: &[u8]) -> Option<u64> {
    let end = header.iter().position(|b| *b == 0).unwrap_or(header.len());
    if end == 0 {
        return None;
    }
    if !header[end..].iter().all(|b| *b == 0) {
        return None;
    }
    std::str::from_utf8(&header[..end]).ok()?.parse().ok()
}

fn count_token_lines(file: &mut File) -> Result<u64> {
    file.seek(SeekFrom::Start((HEADER_LEN + 1) as u64))?;
    let mut reader = BufReader::new(&mut *file);
    let mut lines = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        lines += buf[..n].iter().filter(|b| **b == b'\n').count() as u64;
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("aaa.bbb.ccc{}", i)).collect()
    }

    #[test]
    fn open_empty_file_has_zero_count() {
        let dir = tempfile::tempdir().unwrap();
        let cache = JwtCache::open(&dir.path().join("store.txt")).unwrap();
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn append_updates_header_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.txt");
        let mut cache = JwtCache::open(&path).unwrap();
        cache.append(&tokens(3)).unwrap();
        assert_eq!(cache.count(), 3);

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..1], b"3");
        assert!(raw[1..HEADER_LEN].iter().all(|b| *b == 0));
        assert_eq!(raw[HEADER_LEN], b'\n');
        let body = String::from_utf8(raw[HEADER_LEN + 1..].to_vec()).unwrap();
        assert_eq!(body.lines().count(), 3);

        // reopen reads the same count back
        drop(cache);
        let cache = JwtCache::open(&path).unwrap();
        assert_eq!(cache.count(), 3);
    }

    #[test]
    fn append_is_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.txt");
        let mut cache = JwtCache::open(&path).unwrap();
        cache.append(&tokens(10)).unwrap();
        cache.append(&tokens(10)).unwrap();
        assert_eq!(cache.count(), 20);

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..2], b"20");
        let body = String::from_utf8(raw[HEADER_LEN + 1..].to_vec()).unwrap();
        assert_eq!(body.lines().count(), 20);
    }

    #[test]
    fn non_decimal_header_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.txt");
        let mut raw = vec![0u8; HEADER_LEN + 1];
        raw[0] = 0x05; // legacy binary layout
        raw[HEADER_LEN] = b'\n';
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(
            JwtCache::open(&path).unwrap_err(),
            Error::CorruptCache(_)
        ));
    }

    #[test]
    fn short_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.txt");
        std::fs::write(&path, b"12\n").unwrap();
        assert!(matches!(
            JwtCache::open(&path).unwrap_err(),
            Error::CorruptCache(_)
        ));
    }

    #[test]
    fn fewer_lines_than_header_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.txt");
        let mut cache = JwtCache::open(&path).unwrap();
        cache.append(&tokens(2)).unwrap();
        drop(cache);
        // claim 5 tokens while only 2 lines exist
        let mut raw = std::fs::read(&path).unwrap();
        raw[0] = b'5';
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(
            JwtCache::open(&path).unwrap_err(),
            Error::CorruptCache(_)
        ));
    }

    #[test]
    fn extra_lines_beyond_header_are_tolerated() {
        // crash between data flush and header rewrite leaves extra lines
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.txt");
        let mut cache = JwtCache::open(&path).unwrap();
        cache.append(&tokens(2)).unwrap();
        drop(cache);
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"orphan.token.line\n");
        std::fs::write(&path, raw).unwrap();
        let cache = JwtCache::open(&path).unwrap();
        assert_eq!(cache.count(), 2);
    }

    #[tokio::test]
    async fn read_streams_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.txt");
        let mut cache = JwtCache::open(&path).unwrap();
        let stored = tokens(5);
        cache.append(&stored).unwrap();

        let (rx, _errs) = cache.read(5).await.unwrap();
        let mut got = Vec::new();
        while let Ok(token) = rx.recv().await {
            got.push(token);
        }
        assert_eq!(got, stored);
    }

    #[tokio::test]
    async fn read_rejects_requests_beyond_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.txt");
        let mut cache = JwtCache::open(&path).unwrap();
        cache.append(&tokens(2)).unwrap();
        assert!(cache.read(3).await.is_err());
    }
}

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

/// Hard ceiling on a single log page read.
pub const MAX_READ_LIMIT: u64 = 1_048_576; // 1 MiB

/// Which of the two captured streams a chunk or read refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(LogStream::Stdout),
            "stderr" => Some(LogStream::Stderr),
            _ => None,
        }
    }
}

/// Rolling tail of a byte stream, bounded to the last `cap` bytes.
///
/// Backed by a pre-sized ring (`VecDeque`) so appends never reallocate past
/// the bound and never concatenate-then-slice.
#[derive(Debug)]
pub struct TailBuffer {
    buf: VecDeque<u8>,
    cap: usize,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Append a chunk, keeping only the last `cap` bytes overall.
    pub fn push(&mut self, data: &[u8]) {
        if self.cap == 0 {
            return;
        }
        if data.len() >= self.cap {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Decode the retained tail as UTF-8. Invalid sequences (including a
    /// multi-byte character cut at the ring boundary) become U+FFFD rather
    /// than being dropped.
    pub fn into_string(self) -> String {
        let bytes: Vec<u8> = self.buf.into();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Final per-stream capture metadata, produced when the writer closes.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub size: u64,
    pub truncated: bool,
    pub preview: String,
}

/// Capped append writer for one stream of one job.
struct StreamWriter {
    file: Option<tokio::fs::File>,
    written: u64,
    cap: u64,
    truncated: bool,
    tail: TailBuffer,
}

impl StreamWriter {
    fn new(file: Option<tokio::fs::File>, cap: u64, preview_bytes: usize) -> Self {
        Self {
            file,
            written: 0,
            cap,
            truncated: false,
            tail: TailBuffer::new(preview_bytes),
        }
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.tail.push(data);
        if self.written >= self.cap {
            self.truncated = true;
            return Ok(());
        }
        let room = (self.cap - self.written) as usize;
        let take = data.len().min(room);
        if take < data.len() {
            self.truncated = true;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(&data[..take]).await?;
        }
        self.written += take as u64;
        Ok(())
    }

    async fn close(mut self) -> StreamStats {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush().await {
                tracing::warn!("Failed to flush log file: {}", e);
            }
        }
        StreamStats {
            size: self.written,
            truncated: self.truncated,
            preview: self.tail.into_string(),
        }
    }
}

/// Owns the two per-job log file handles for the duration of a run.
///
/// Write failures are non-fatal: the chunk is dropped from disk (the tail
/// still sees it) and a diagnostic line lands in the stderr preview.
pub struct JobLogWriter {
    stdout: StreamWriter,
    stderr: StreamWriter,
}

impl JobLogWriter {
    pub async fn write(&mut self, stream: LogStream, data: &[u8]) {
        let result = match stream {
            LogStream::Stdout => self.stdout.write(data).await,
            LogStream::Stderr => self.stderr.write(data).await,
        };
        if let Err(e) = result {
            tracing::warn!("Log write failed on {}: {}", stream.as_str(), e);
            let note = format!("\n[log write error on {}: {}]\n", stream.as_str(), e);
            self.stderr.tail.push(note.as_bytes());
        }
    }

    /// Record a diagnostic in the stderr preview without touching disk.
    pub fn push_stderr_note(&mut self, msg: &str) {
        self.stderr.tail.push(msg.as_bytes());
    }

    /// Flush and close both handles, yielding (stdout, stderr) capture stats.
    pub async fn finalize(self) -> (StreamStats, StreamStats) {
        let stdout = self.stdout.close().await;
        let stderr = self.stderr.close().await;
        (stdout, stderr)
    }
}

/// One page of a random-access log read.
#[derive(Debug, Clone)]
pub struct LogPage {
    pub offset: u64,
    pub next_offset: u64,
    pub total_size: u64,
    pub data: String,
}

/// Filesystem-backed sink for captured job output: two append-only files per
/// job under `logs_dir`, each capped at `max_bytes`.
pub struct LogSink {
    logs_dir: PathBuf,
    max_bytes: u64,
    preview_bytes: usize,
}

impl LogSink {
    pub async fn new(logs_dir: PathBuf, max_bytes: u64, preview_bytes: usize) -> Result<Self> {
        tokio::fs::create_dir_all(&logs_dir)
            .await
            .context("Failed to create logs directory")?;
        Ok(Self {
            logs_dir,
            max_bytes,
            preview_bytes,
        })
    }

    /// Log file name for one stream of one job.
    pub fn stream_file(job_id: Uuid, stream: LogStream) -> String {
        format!("{}.{}.log", job_id, stream.as_str())
    }

    /// Open the pair of capped writers for a job about to run. A file that
    /// cannot be opened degrades to preview-only capture for that stream.
    pub async fn open_writer(&self, job_id: Uuid) -> JobLogWriter {
        let stdout_file = self.open_stream_file(job_id, LogStream::Stdout).await;
        let stderr_file = self.open_stream_file(job_id, LogStream::Stderr).await;
        JobLogWriter {
            stdout: StreamWriter::new(stdout_file, self.max_bytes, self.preview_bytes),
            stderr: StreamWriter::new(stderr_file, self.max_bytes, self.preview_bytes),
        }
    }

    async fn open_stream_file(&self, job_id: Uuid, stream: LogStream) -> Option<tokio::fs::File> {
        let path = self.logs_dir.join(Self::stream_file(job_id, stream));
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::error!("Failed to open log file {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Read a byte range of a log file.
    ///
    /// `limit` is clamped to [`MAX_READ_LIMIT`]. A missing file (job never
    /// started, or never wrote) and an offset at or past the end both return
    /// an empty page with `next_offset == offset`.
    pub async fn read_page(&self, file_name: &str, offset: u64, limit: u64) -> Result<LogPage> {
        let limit = limit.min(MAX_READ_LIMIT);
        let path = self.logs_dir.join(file_name);

        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LogPage {
                    offset,
                    next_offset: offset,
                    total_size: 0,
                    data: String::new(),
                });
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", path.display()))
            }
        };

        let total_size = file
            .metadata()
            .await
            .context("Failed to stat log file")?
            .len();

        if offset >= total_size {
            return Ok(LogPage {
                offset,
                next_offset: offset,
                total_size,
                data: String::new(),
            });
        }

        file.seek(SeekFrom::Start(offset))
            .await
            .context("Failed to seek log file")?;

        let to_read = limit.min(total_size - offset);
        let mut buf = Vec::with_capacity(to_read as usize);
        file.take(to_read)
            .read_to_end(&mut buf)
            .await
            .context("Failed to read log file")?;

        let read = buf.len() as u64;
        Ok(LogPage {
            offset,
            next_offset: offset + read,
            total_size,
            data: String::from_utf8_lossy(&buf).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_sink(max_bytes: u64, preview_bytes: usize) -> (LogSink, TempDir) {
        let tmp = TempDir::new().expect("create temp dir");
        let sink = LogSink::new(tmp.path().join("logs"), max_bytes, preview_bytes)
            .await
            .expect("create sink");
        (sink, tmp)
    }

    // -----------------------------------------------------------------------
    // TailBuffer
    // -----------------------------------------------------------------------

    #[test]
    fn test_tail_buffer_keeps_last_bytes() {
        let mut tail = TailBuffer::new(5);
        tail.push(b"abcdefgh");
        assert_eq!(tail.into_string(), "defgh");
    }

    #[test]
    fn test_tail_buffer_accumulates_small_chunks() {
        let mut tail = TailBuffer::new(8);
        tail.push(b"abc");
        tail.push(b"def");
        assert_eq!(tail.len(), 6);
        tail.push(b"ghi");
        assert_eq!(tail.into_string(), "bcdefghi");
    }

    #[test]
    fn test_tail_buffer_zero_capacity() {
        let mut tail = TailBuffer::new(0);
        tail.push(b"anything");
        assert!(tail.is_empty());
        assert_eq!(tail.into_string(), "");
    }

    #[test]
    fn test_tail_buffer_chunk_exactly_capacity() {
        let mut tail = TailBuffer::new(4);
        tail.push(b"wxyz");
        assert_eq!(tail.into_string(), "wxyz");
    }

    #[test]
    fn test_tail_buffer_split_utf8_becomes_replacement() {
        // "héllo" = 68 c3 a9 6c 6c 6f; a 4-byte tail cuts the é in half.
        let mut tail = TailBuffer::new(4);
        tail.push("héllo".as_bytes());
        let s = tail.into_string();
        assert!(
            s.starts_with('\u{FFFD}'),
            "expected replacement char at cut boundary, got {:?}",
            s
        );
        assert!(s.ends_with("llo"));
    }

    // -----------------------------------------------------------------------
    // JobLogWriter caps and previews
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_writer_under_cap_writes_everything() {
        let (sink, _tmp) = setup_sink(1024, 64).await;
        let job_id = Uuid::now_v7();

        let mut writer = sink.open_writer(job_id).await;
        writer.write(LogStream::Stdout, b"hello\n").await;
        writer.write(LogStream::Stdout, b"world\n").await;
        let (stdout, stderr) = writer.finalize().await;

        assert_eq!(stdout.size, 12);
        assert!(!stdout.truncated);
        assert_eq!(stdout.preview, "hello\nworld\n");
        assert_eq!(stderr.size, 0);
        assert!(!stderr.truncated);

        let page = sink
            .read_page(&LogSink::stream_file(job_id, LogStream::Stdout), 0, 1024)
            .await
            .expect("read");
        assert_eq!(page.data, "hello\nworld\n");
        assert_eq!(page.total_size, 12);
    }

    #[tokio::test]
    async fn test_writer_clamps_chunk_straddling_cap() {
        let (sink, _tmp) = setup_sink(8, 64).await;
        let job_id = Uuid::now_v7();

        let mut writer = sink.open_writer(job_id).await;
        writer.write(LogStream::Stdout, b"0123456789").await;
        let (stdout, _) = writer.finalize().await;

        assert_eq!(stdout.size, 8, "only cap bytes reach disk");
        assert!(stdout.truncated);
        // The preview still holds the full tail, unclamped.
        assert_eq!(stdout.preview, "0123456789");

        let page = sink
            .read_page(&LogSink::stream_file(job_id, LogStream::Stdout), 0, 1024)
            .await
            .expect("read");
        assert_eq!(page.data, "01234567");
    }

    #[tokio::test]
    async fn test_writer_discards_after_cap_reached() {
        let (sink, _tmp) = setup_sink(4, 64).await;
        let job_id = Uuid::now_v7();

        let mut writer = sink.open_writer(job_id).await;
        writer.write(LogStream::Stderr, b"abcd").await;
        writer.write(LogStream::Stderr, b"efgh").await;
        let (_, stderr) = writer.finalize().await;

        assert_eq!(stderr.size, 4);
        assert!(stderr.truncated);
        assert_eq!(stderr.preview, "abcdefgh");
    }

    #[tokio::test]
    async fn test_writer_exact_cap_is_not_truncated() {
        let (sink, _tmp) = setup_sink(4, 64).await;
        let job_id = Uuid::now_v7();

        let mut writer = sink.open_writer(job_id).await;
        writer.write(LogStream::Stdout, b"abcd").await;
        let (stdout, _) = writer.finalize().await;

        assert_eq!(stdout.size, 4);
        assert!(
            !stdout.truncated,
            "writing exactly cap bytes is not truncation"
        );
    }

    #[tokio::test]
    async fn test_writer_zero_cap_writes_nothing_but_flags() {
        let (sink, _tmp) = setup_sink(0, 64).await;
        let job_id = Uuid::now_v7();

        let mut writer = sink.open_writer(job_id).await;
        writer.write(LogStream::Stdout, b"output").await;
        let (stdout, stderr) = writer.finalize().await;

        assert_eq!(stdout.size, 0);
        assert!(stdout.truncated, "any output under a zero cap is truncation");
        assert_eq!(stdout.preview, "output");
        assert!(!stderr.truncated, "silent stream is not truncated");
    }

    #[tokio::test]
    async fn test_writer_zero_cap_no_output_not_truncated() {
        let (sink, _tmp) = setup_sink(0, 64).await;
        let mut writer = sink.open_writer(Uuid::now_v7()).await;
        writer.write(LogStream::Stdout, b"").await;
        let (stdout, _) = writer.finalize().await;
        assert!(!stdout.truncated);
        assert_eq!(stdout.size, 0);
    }

    #[tokio::test]
    async fn test_stderr_note_lands_in_preview_only() {
        let (sink, _tmp) = setup_sink(1024, 128).await;
        let job_id = Uuid::now_v7();

        let mut writer = sink.open_writer(job_id).await;
        writer.push_stderr_note("spawn error: no such file");
        let (_, stderr) = writer.finalize().await;

        assert_eq!(stderr.preview, "spawn error: no such file");
        assert_eq!(stderr.size, 0, "notes never reach disk");
    }

    // -----------------------------------------------------------------------
    // Random-access reads
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_read_page_paginates_in_order() {
        let (sink, _tmp) = setup_sink(1024, 64).await;
        let job_id = Uuid::now_v7();

        let mut writer = sink.open_writer(job_id).await;
        writer
            .write(LogStream::Stdout, b"0123456789abcdefghij")
            .await;
        writer.finalize().await;

        let file = LogSink::stream_file(job_id, LogStream::Stdout);
        let mut offset = 0;
        let mut collected = String::new();
        loop {
            let page = sink.read_page(&file, offset, 7).await.expect("read");
            assert_eq!(page.offset, offset);
            assert!(page.next_offset >= page.offset, "nextOffset is monotonic");
            if page.data.is_empty() {
                break;
            }
            collected.push_str(&page.data);
            offset = page.next_offset;
        }
        assert_eq!(collected, "0123456789abcdefghij");
    }

    #[tokio::test]
    async fn test_read_page_offset_past_end_is_empty() {
        let (sink, _tmp) = setup_sink(1024, 64).await;
        let job_id = Uuid::now_v7();

        let mut writer = sink.open_writer(job_id).await;
        writer.write(LogStream::Stdout, b"short").await;
        writer.finalize().await;

        let file = LogSink::stream_file(job_id, LogStream::Stdout);
        let page = sink.read_page(&file, 99, 10).await.expect("read");
        assert_eq!(page.offset, 99);
        assert_eq!(page.next_offset, 99);
        assert_eq!(page.total_size, 5);
        assert!(page.data.is_empty());
    }

    #[tokio::test]
    async fn test_read_page_missing_file_is_empty() {
        let (sink, _tmp) = setup_sink(1024, 64).await;
        let file = LogSink::stream_file(Uuid::now_v7(), LogStream::Stdout);
        let page = sink.read_page(&file, 0, 10).await.expect("read");
        assert_eq!(page.total_size, 0);
        assert_eq!(page.next_offset, 0);
        assert!(page.data.is_empty());
    }

    #[tokio::test]
    async fn test_read_page_limit_clamped_to_max() {
        let (sink, _tmp) = setup_sink(8 * 1024 * 1024, 64).await;
        let job_id = Uuid::now_v7();

        let mut writer = sink.open_writer(job_id).await;
        let big = vec![b'x'; 2 * 1024 * 1024];
        writer.write(LogStream::Stdout, &big).await;
        writer.finalize().await;

        let file = LogSink::stream_file(job_id, LogStream::Stdout);
        let page = sink.read_page(&file, 0, u64::MAX).await.expect("read");
        assert_eq!(page.data.len() as u64, MAX_READ_LIMIT);
        assert_eq!(page.next_offset, MAX_READ_LIMIT);
        assert_eq!(page.total_size, 2 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_full_read_returns_exact_bytes_in_order() {
        let (sink, _tmp) = setup_sink(1024, 64).await;
        let job_id = Uuid::now_v7();

        let mut writer = sink.open_writer(job_id).await;
        for i in 0..10 {
            writer
                .write(LogStream::Stdout, format!("line {}\n", i).as_bytes())
                .await;
        }
        writer.finalize().await;

        let file = LogSink::stream_file(job_id, LogStream::Stdout);
        let page = sink
            .read_page(&file, 0, MAX_READ_LIMIT)
            .await
            .expect("read");
        let expected: String = (0..10).map(|i| format!("line {}\n", i)).collect();
        assert_eq!(page.data, expected);
        assert_eq!(page.total_size as usize, expected.len());
    }
}

//! Replayable request bodies
//!
//! A request body must be writable to a second candidate route after a
//! connect failure, but the client socket cannot be rewound. The first
//! write streams the body through while capturing it; bodies up to the
//! configured threshold are kept in memory, larger or unknown-length
//! (chunked) bodies spill to a uniquely named temp file that is removed
//! when the body is closed.

use std::path::PathBuf;

use bytes::Bytes;
use http::HeaderMap;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use super::wire;

const COPY_BUFFER_SIZE: usize = 8 * 1024;

enum BodyState {
    /// Nothing to capture or send.
    Empty,
    /// First pass pending: reads come from the client socket.
    Streaming,
    /// Captured in memory.
    Memory(Bytes),
    /// Captured in a spooled temp file.
    Spooled(PathBuf),
}

pub struct RepeatableBody {
    /// Declared Content-Length; -1 when unknown (chunked or until-EOF).
    content_length: i64,
    chunked: bool,
    threshold: usize,
    temp_dir: PathBuf,
    state: BodyState,
}

impl RepeatableBody {
    /// Build a body from request headers. Returns None when the request
    /// encloses no body at all (no Content-Length, not chunked).
    pub fn from_headers(headers: &HeaderMap, threshold: usize, temp_dir: PathBuf) -> Option<Self> {
        let chunked = wire::transfer_encoding_is_chunked(headers);
        let content_length = wire::content_length_of(headers);
        if !chunked && content_length.is_none() {
            return None;
        }
        let content_length = if chunked {
            -1
        } else {
            content_length.unwrap_or(-1)
        };
        let state = if content_length == 0 {
            BodyState::Empty
        } else {
            BodyState::Streaming
        };
        Some(Self {
            content_length,
            chunked,
            threshold,
            temp_dir,
            state,
        })
    }

    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    /// Whether the outbound body needs chunked framing (length unknown).
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.state, BodyState::Empty)
    }

    /// Write the body to `dst`. The first call streams from `src` while
    /// capturing; later calls replay the capture and ignore `src`.
    /// Chunked bodies are de-chunked into the capture and re-framed on the
    /// way out.
    pub async fn write_to<R, W>(&mut self, src: &mut R, dst: &mut W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match &self.state {
            BodyState::Empty => Ok(()),
            BodyState::Streaming => {
                let state = self.stream_and_capture(src, dst).await?;
                self.state = state;
                Ok(())
            }
            BodyState::Memory(bytes) => {
                let bytes = bytes.clone();
                self.replay_bytes(&bytes, dst).await
            }
            BodyState::Spooled(path) => {
                let path = path.clone();
                self.replay_file(&path, dst).await
            }
        }
    }

    async fn stream_and_capture<R, W>(
        &self,
        src: &mut R,
        dst: &mut W,
    ) -> std::io::Result<BodyState>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.content_length > 0 && self.content_length as usize <= self.threshold {
            // Small declared body: capture in memory.
            let mut captured = Vec::with_capacity(self.content_length as usize);
            let mut remaining = self.content_length as u64;
            let mut buffer = [0u8; COPY_BUFFER_SIZE];
            while remaining > 0 {
                let want = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
                let n = src.read(&mut buffer[..want]).await?;
                if n == 0 {
                    break;
                }
                dst.write_all(&buffer[..n]).await?;
                dst.flush().await?;
                captured.extend_from_slice(&buffer[..n]);
                remaining -= n as u64;
            }
            return Ok(BodyState::Memory(Bytes::from(captured)));
        }

        // Large or unknown-length body: spool to disk while streaming.
        let path = self
            .temp_dir
            .join(format!("portico-body-{}.tmp", Uuid::new_v4()));
        let mut spool = File::create(&path).await?;
        let mut buffer = [0u8; COPY_BUFFER_SIZE];

        let result: std::io::Result<()> = async {
            if self.chunked {
                // De-chunk into the spool, re-frame toward the upstream.
                loop {
                    let Some(size) = wire::read_chunk_size(src).await? else {
                        break;
                    };
                    let mut remaining = size;
                    while remaining > 0 {
                        let want = remaining.min(COPY_BUFFER_SIZE);
                        let n = src.read(&mut buffer[..want]).await?;
                        if n == 0 {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "truncated chunk",
                            ));
                        }
                        wire::write_chunk(dst, &buffer[..n]).await?;
                        dst.flush().await?;
                        spool.write_all(&buffer[..n]).await?;
                        remaining -= n;
                    }
                    wire::read_chunk_terminator(src).await?;
                }
                wire::write_last_chunk(dst).await?;
                dst.flush().await?;
            } else if self.content_length > 0 {
                let mut remaining = self.content_length as u64;
                while remaining > 0 {
                    let want = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
                    let n = src.read(&mut buffer[..want]).await?;
                    if n == 0 {
                        break;
                    }
                    dst.write_all(&buffer[..n]).await?;
                    dst.flush().await?;
                    spool.write_all(&buffer[..n]).await?;
                    remaining -= n as u64;
                }
            } else {
                // Unknown length, not chunked: consume until EOF.
                loop {
                    let n = src.read(&mut buffer).await?;
                    if n == 0 {
                        break;
                    }
                    dst.write_all(&buffer[..n]).await?;
                    dst.flush().await?;
                    spool.write_all(&buffer[..n]).await?;
                }
            }
            spool.flush().await
        }
        .await;

        if let Err(e) = result {
            drop(spool);
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        Ok(BodyState::Spooled(path))
    }

    async fn replay_bytes<W>(&self, bytes: &Bytes, dst: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        dst.write_all(bytes).await?;
        dst.flush().await
    }

    async fn replay_file<W>(&self, path: &PathBuf, dst: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut file = File::open(path).await?;
        let mut buffer = [0u8; COPY_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            if self.chunked {
                wire::write_chunk(dst, &buffer[..n]).await?;
            } else {
                dst.write_all(&buffer[..n]).await?;
            }
        }
        if self.chunked {
            wire::write_last_chunk(dst).await?;
        }
        dst.flush().await
    }

    /// Remove the spooled file, if any. Also runs on drop.
    pub fn close(&mut self) {
        if let BodyState::Spooled(path) = &self.state {
            debug!("Removing spooled body file {:?}", path);
            let _ = std::fs::remove_file(path);
        }
        self.state = BodyState::Empty;
    }
}

impl Drop for RepeatableBody {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
    use tokio::io::BufReader;

    fn headers_with_length(len: usize) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, len.to_string().parse().unwrap());
        headers
    }

    fn chunked_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers
    }

    fn temp_file_count(dir: &tempfile::TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[tokio::test]
    async fn test_body_at_threshold_stays_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![b'x'; 64];
        let mut body =
            RepeatableBody::from_headers(&headers_with_length(64), 64, dir.path().to_path_buf())
                .unwrap();

        let mut src = BufReader::new(&payload[..]);
        let mut first = Vec::new();
        body.write_to(&mut src, &mut first).await.unwrap();

        assert_eq!(first, payload);
        assert_eq!(temp_file_count(&dir), 0);

        // Replay ignores the source.
        let mut empty = BufReader::new(&[][..]);
        let mut second = Vec::new();
        body.write_to(&mut empty, &mut second).await.unwrap();
        assert_eq!(second, payload);
    }

    #[tokio::test]
    async fn test_body_over_threshold_spools_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![b'y'; 65];
        let mut body =
            RepeatableBody::from_headers(&headers_with_length(65), 64, dir.path().to_path_buf())
                .unwrap();

        let mut src = BufReader::new(&payload[..]);
        let mut first = Vec::new();
        body.write_to(&mut src, &mut first).await.unwrap();

        assert_eq!(first, payload);
        assert_eq!(temp_file_count(&dir), 1);

        let mut empty = BufReader::new(&[][..]);
        let mut second = Vec::new();
        body.write_to(&mut empty, &mut second).await.unwrap();
        assert_eq!(second, payload);

        body.close();
        assert_eq!(temp_file_count(&dir), 0);
    }

    #[tokio::test]
    async fn test_chunked_body_always_spools() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoded = Vec::new();
        wire::write_chunk(&mut encoded, b"tiny").await.unwrap();
        wire::write_last_chunk(&mut encoded).await.unwrap();

        let mut body =
            RepeatableBody::from_headers(&chunked_headers(), 1024, dir.path().to_path_buf())
                .unwrap();
        assert!(body.is_chunked());
        assert_eq!(body.content_length(), -1);

        let mut src = BufReader::new(&encoded[..]);
        let mut first = Vec::new();
        body.write_to(&mut src, &mut first).await.unwrap();

        // Small payload, but unknown length means the disk path.
        assert_eq!(temp_file_count(&dir), 1);

        // The outbound copy is re-framed as chunked.
        let mut reader = BufReader::new(&first[..]);
        let size = wire::read_chunk_size(&mut reader).await.unwrap();
        assert_eq!(size, Some(4));

        // Replay emits the same payload, chunked again.
        let mut empty = BufReader::new(&[][..]);
        let mut second = Vec::new();
        body.write_to(&mut empty, &mut second).await.unwrap();
        let mut reader = BufReader::new(&second[..]);
        let mut decoded = Vec::new();
        while let Some(size) = wire::read_chunk_size(&mut reader).await.unwrap() {
            let mut data = vec![0u8; size];
            reader.read_exact(&mut data).await.unwrap();
            decoded.extend_from_slice(&data);
            wire::read_chunk_terminator(&mut reader).await.unwrap();
        }
        assert_eq!(decoded, b"tiny");

        body.close();
        assert_eq!(temp_file_count(&dir), 0);
    }

    #[tokio::test]
    async fn test_zero_length_body_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut body =
            RepeatableBody::from_headers(&headers_with_length(0), 64, dir.path().to_path_buf())
                .unwrap();
        assert!(body.is_empty());

        let mut src = BufReader::new(&[][..]);
        let mut out = Vec::new();
        body.write_to(&mut src, &mut out).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(temp_file_count(&dir), 0);
    }

    #[test]
    fn test_no_body_headers_give_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            RepeatableBody::from_headers(&HeaderMap::new(), 64, dir.path().to_path_buf()).is_none()
        );
    }

    #[tokio::test]
    async fn test_drop_removes_spooled_file() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![b'z'; 100];
        {
            let mut body = RepeatableBody::from_headers(
                &headers_with_length(100),
                10,
                dir.path().to_path_buf(),
            )
            .unwrap();
            let mut src = BufReader::new(&payload[..]);
            let mut out = Vec::new();
            body.write_to(&mut src, &mut out).await.unwrap();
            assert_eq!(temp_file_count(&dir), 1);
        }
        assert_eq!(temp_file_count(&dir), 0);
    }
}

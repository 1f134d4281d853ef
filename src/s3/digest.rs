//! Reader wrapper that accumulates a content digest.

use md5::{Digest as _, Md5};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// An [`AsyncRead`] that computes an MD5 digest over all bytes read so far.
///
/// MD5 is used because the object store requires it for an etag; it is not
/// relied upon as a secure checksum. The toolchain verifies the content
/// address against the bytes actually stored.
pub struct DigestReader<R> {
    inner: R,
    hash: Md5,
}

impl<R> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hash: Md5::new(),
        }
    }

    /// The etag for the bytes read so far, as lowercase hex.
    pub fn digest(&self) -> String {
        hex::encode(self.hash.clone().finalize())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                me.hash.update(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn digest_matches_whole_input() {
        let data = b"hello, stockpile".to_vec();
        let want = hex::encode(Md5::digest(&data));

        let mut r = DigestReader::new(std::io::Cursor::new(data));
        let mut sink = Vec::new();
        r.read_to_end(&mut sink).await.unwrap();
        assert_eq!(r.digest(), want);
    }

    #[tokio::test]
    async fn digest_is_incremental() {
        let mut r = DigestReader::new(std::io::Cursor::new(b"abcdef".to_vec()));
        let empty = r.digest();
        assert_eq!(empty, hex::encode(Md5::digest(b"")));

        let mut buf = [0u8; 3];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(r.digest(), hex::encode(Md5::digest(b"abc")));
    }
}

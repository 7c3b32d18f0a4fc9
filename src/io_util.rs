use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::util::timeout_with_context;

pub async fn write_all_with_timeout<W>(
    writer: &mut W,
    data: &[u8],
    timeout_dur: Duration,
    context: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    timeout_with_context(timeout_dur, writer.write_all(data), context).await
}

/// Reader that appends every byte it yields to an in-memory copy.
pub struct TeeReader<R> {
    reader: R,
    copy: Vec<u8>,
}

impl<R> TeeReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            copy: Vec::new(),
        }
    }

    pub fn copied(&self) -> usize {
        self.copy.len()
    }

    pub fn into_copy(self) -> Vec<u8> {
        self.copy
    }
}

impl<R> AsyncRead for TeeReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let start = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.reader).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.copy.extend_from_slice(&buf.filled()[start..]);
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
    async fn tee_reader_copies_what_it_yields() {
        let mut tee = TeeReader::new(&b"hello world"[..]);
        let mut head = [0u8; 5];
        tee.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"hello");
        assert_eq!(tee.copied(), 5);

        let mut rest = Vec::new();
        tee.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b" world");
        assert_eq!(tee.into_copy(), b"hello world");
    }

    #[tokio::test]
    async fn write_all_with_timeout_writes_everything() {
        let mut out = Vec::new();
        write_all_with_timeout(&mut out, b"abc", Duration::from_secs(1), "writing test data")
            .await
            .unwrap();
        assert_eq!(out, b"abc");
    }
}

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 8192;

/// Bytes read from one output stream, never more than the cap.
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl Captured {
    /// Decode as UTF-8 (lossy) without letting replacement characters push
    /// the text past `cap` bytes.
    pub fn into_text(self, cap: usize) -> (String, bool) {
        let (text, clipped) = clamp_utf8(&self.bytes, cap);
        (text, self.truncated || clipped)
    }
}

/// Read `reader` to EOF, keeping at most `cap` bytes and discarding the rest
/// so the writer never blocks on a full pipe. Returns early with whatever was
/// collected once `stop` fires.
pub(crate) async fn capture<R>(mut reader: R, cap: usize, stop: CancellationToken) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut out = Captured {
        bytes: Vec::with_capacity(cap.min(CHUNK_SIZE)),
        truncated: false,
    };
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
            _ = stop.cancelled() => break,
        };

        let chunk = buf.get(..n).unwrap_or_default();
        let room = cap.saturating_sub(out.bytes.len());
        if chunk.len() > room {
            out.truncated = true;
        }
        out.bytes
            .extend_from_slice(chunk.get(..room.min(chunk.len())).unwrap_or_default());
    }

    out
}

fn clamp_utf8(bytes: &[u8], cap: usize) -> (String, bool) {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() <= cap {
        return (text, false);
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    (text, true)
}

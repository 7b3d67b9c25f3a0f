//! The splicer: a two-direction byte relay between a paired stream pair.

use crate::error::Result;
use crate::stream::{ReadHalf, Stream, WriteHalf};

/// Upper bound on a single transfer. The UDP listener sizes its receive
/// buffer to the same value so nothing downstream truncates further.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Relays bytes between `a` and `b` until either direction ends.
///
/// Both one-way copies run concurrently; when the first terminates (EOF,
/// error, or read deadline) the other is cancelled and both transports are
/// dropped, which closes them. `id` tags the pair in the log.
pub async fn splice(id: u64, a: Stream, b: Stream) {
    let (mut a_read, mut a_write) = a.into_split();
    let (mut b_read, mut b_write) = b.into_split();

    tokio::select! {
        result = copy_one_way(&mut a_read, &mut b_write) => match result {
            Ok(_) => tracing::info!("link{}(A=>B) exited", id),
            // An idle deadline is end-of-stream for a datagram side, not a
            // fault.
            Err(e) if e.is_timeout() => tracing::info!("link{}(A=>B): {}", id, e),
            Err(e) => tracing::error!("link{}(A=>B): {}", id, e),
        },
        result = copy_one_way(&mut b_read, &mut a_write) => match result {
            Ok(_) => tracing::info!("link{}(B=>A) exited", id),
            Err(e) if e.is_timeout() => tracing::info!("link{}(B=>A): {}", id, e),
            Err(e) => tracing::error!("link{}(B=>A): {}", id, e),
        },
    }
}

/// Copies from `src` to `dst` in bounded chunks until end of stream or
/// error, returning the number of bytes moved.
async fn copy_one_way(src: &mut ReadHalf, dst: &mut WriteHalf) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            if src.eof_on_empty_read() {
                return Ok(total);
            }
            // Empty datagram: nothing to relay, the session stays up.
            continue;
        }
        dst.write(&buf[..n]).await?;
        total += n as u64;
    }
}

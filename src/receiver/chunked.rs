use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

/// Waits for the next chunk of at most `size` items.
///
/// The window opens when the first item of the chunk arrives; the chunk is emitted when it is
/// full or the window closes, whichever comes first. Returns `None` once the channel is closed
/// and drained.
pub(crate) async fn next_chunk<T>(
    rx: &mut mpsc::Receiver<T>,
    size: usize,
    window: Duration,
) -> Option<Vec<T>> {
    let first = rx.recv().await?;
    let deadline = Instant::now() + window;

    let mut chunk = Vec::with_capacity(size);
    chunk.push(first);
    while chunk.len() < size {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(item)) => chunk.push(item),
            Ok(None) | Err(_) => break,
        }
    }
    Some(chunk)
}

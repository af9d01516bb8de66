//! In-process resumable stream registry.
//!
//! Each published stream is an append-only log of encoded wire lines. Any
//! number of readers can attach from a byte offset and follow the log until
//! the producer finishes. Finished logs linger briefly for late reconnects and
//! are then discarded; resuming a discarded stream yields `None`.

use crate::types::{ChatwireError, Result, StreamId};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

#[derive(Debug, Default)]
struct LogBuffer {
    data: Vec<u8>,
    finished: bool,
}

#[derive(Debug)]
struct StreamLog {
    buffer: Mutex<LogBuffer>,
    // Bumped on every append and on finish.
    version: watch::Sender<u64>,
}

impl StreamLog {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            buffer: Mutex::new(LogBuffer::default()),
            version,
        }
    }

    fn append(&self, chunk: &str) {
        lock(&self.buffer).data.extend_from_slice(chunk.as_bytes());
        self.version.send_modify(|v| *v += 1);
    }

    fn finish(&self) {
        lock(&self.buffer).finished = true;
        self.version.send_modify(|v| *v += 1);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct StreamRegistry {
    entries: Arc<Mutex<HashMap<StreamId, Arc<StreamLog>>>>,
    linger: Duration,
    tasks: TaskTracker,
}

impl StreamRegistry {
    pub fn new(linger: Duration, tasks: TaskTracker) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            linger,
            tasks,
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Starts pumping `producer` into a new log under `stream_id`.
    /// Stream ids are never reused; publishing an id twice is rejected.
    pub fn publish<S>(&self, stream_id: StreamId, producer: S) -> Result<()>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let log = Arc::new(StreamLog::new());
        {
            let mut entries = lock(&self.entries);
            if entries.contains_key(&stream_id) {
                return Err(ChatwireError::Conflict(format!(
                    "stream {} already exists",
                    stream_id
                ))
                .into());
            }
            entries.insert(stream_id.clone(), log.clone());
        }

        let entries = self.entries.clone();
        let linger = self.linger;
        self.tasks.spawn(async move {
            tokio::pin!(producer);
            while let Some(chunk) = producer.next().await {
                log.append(&chunk);
            }
            log.finish();
            tracing::debug!("Stream {} finished; lingering {:?}", stream_id.short(), linger);

            tokio::time::sleep(linger).await;
            lock(&entries).remove(&stream_id);
        });
        Ok(())
    }

    /// Attaches to `stream_id` from byte `offset`. Offsets are exact, so a
    /// reader that stopped inside a multi-byte char gets the rest of it.
    /// `None` when the stream is unknown or already discarded.
    pub fn resume(
        &self,
        stream_id: &StreamId,
        offset: usize,
    ) -> Option<BoxStream<'static, std::result::Result<Bytes, Infallible>>> {
        let log = lock(&self.entries).get(stream_id).cloned()?;
        let rx = log.version.subscribe();

        let stream = futures_util::stream::unfold(
            (log, rx, offset),
            |(log, mut rx, mut offset)| async move {
                loop {
                    rx.borrow_and_update();
                    let (chunk, finished) = {
                        let buffer = lock(&log.buffer);
                        let chunk = if offset < buffer.data.len() {
                            Some(Bytes::copy_from_slice(&buffer.data[offset..]))
                        } else {
                            None
                        };
                        offset = buffer.data.len().max(offset);
                        (chunk, buffer.finished)
                    };
                    if let Some(chunk) = chunk {
                        return Some((Ok(chunk), (log, rx, offset)));
                    }
                    if finished {
                        return None;
                    }
                    if rx.changed().await.is_err() {
                        return None;
                    }
                }
            },
        );
        Some(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    async fn collect(stream: BoxStream<'static, std::result::Result<Bytes, Infallible>>) -> String {
        let chunks: Vec<_> = stream.collect().await;
        chunks
            .into_iter()
            .filter_map(|c| c.ok())
            .map(|b| String::from_utf8_lossy(&b).to_string())
            .collect()
    }

    #[tokio::test]
    async fn late_reader_replays_from_offset() {
        let registry = StreamRegistry::new(Duration::from_secs(60), TaskTracker::new());
        let (tx, rx) = mpsc::channel(8);
        let id = StreamId::from("s1");
        if let Err(e) = registry.publish(id.clone(), ReceiverStream::new(rx)) {
            panic!("publish failed: {}", e);
        }

        let live = match registry.resume(&id, 0) {
            Some(s) => s,
            None => panic!("stream missing"),
        };
        let reader = tokio::spawn(collect(live));

        let _ = tx.send("0:\"ab\"\n".to_string()).await;
        let _ = tx.send("0:\"cd\"\n".to_string()).await;
        drop(tx);

        let full = match reader.await {
            Ok(s) => s,
            Err(e) => panic!("reader panicked: {}", e),
        };
        assert_eq!(full, "0:\"ab\"\n0:\"cd\"\n");

        let tail = match registry.resume(&id, 7) {
            Some(s) => collect(s).await,
            None => panic!("finished stream should linger"),
        };
        assert_eq!(tail, "0:\"cd\"\n");
    }

    #[tokio::test(start_paused = true)]
    async fn discarded_stream_cannot_be_resumed() {
        let registry = StreamRegistry::new(Duration::from_secs(5), TaskTracker::new());
        let id = StreamId::from("s2");
        let _ = registry.publish(id.clone(), futures_util::stream::iter(vec!["x\n".to_string()]));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(registry.resume(&id, 0).is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn stream_ids_are_not_reused() {
        let registry = StreamRegistry::new(Duration::from_secs(60), TaskTracker::new());
        let id = StreamId::from("s3");
        assert!(registry
            .publish(id.clone(), futures_util::stream::pending::<String>())
            .is_ok());
        assert!(registry
            .publish(id, futures_util::stream::pending::<String>())
            .is_err());
    }

    #[tokio::test]
    async fn offset_inside_a_char_resumes_mid_char() {
        let registry = StreamRegistry::new(Duration::from_secs(60), TaskTracker::new());
        let id = StreamId::from("s4");
        let _ = registry.publish(id.clone(), futures_util::stream::iter(vec!["é!".to_string()]));
        let tail = match registry.resume(&id, 1) {
            Some(s) => s.collect::<Vec<_>>().await,
            None => panic!("stream missing"),
        };
        let mut bytes = "é!".as_bytes()[..1].to_vec();
        for chunk in tail.into_iter().flatten() {
            bytes.extend_from_slice(&chunk);
        }
        assert_eq!(String::from_utf8(bytes).ok().as_deref(), Some("é!"));
    }
}

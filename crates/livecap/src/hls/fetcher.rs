//! Segment download with bounded retry; one batch directory per iteration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, trace, warn};

use super::playlist::Segment;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::{CaptureError, Result};

/// Source of raw segment bytes.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn fetch_segment(&self, segment: &Segment) -> Result<Bytes>;
}

/// Plain HTTP GET. Connection failures are retried immediately a few times
/// before the error is reported to the caller.
pub struct HttpSegmentSource {
    client: Client,
    transport_retries: u32,
}

impl HttpSegmentSource {
    pub fn new(client: Client, transport_retries: u32) -> Self {
        Self {
            client,
            transport_retries,
        }
    }

    async fn send(&self, uri: &str) -> Result<reqwest::Response> {
        let mut reconnects = 0;
        loop {
            match self.client.get(uri).send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() && reconnects < self.transport_retries => {
                    reconnects += 1;
                    trace!(uri, reconnects, "Reconnecting after connect error");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn classify_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl SegmentSource for HttpSegmentSource {
    async fn fetch_segment(&self, segment: &Segment) -> Result<Bytes> {
        let response = self.send(&segment.uri).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CaptureError::SegmentFetch {
                uri: segment.uri.clone(),
                reason: format!("HTTP {status}"),
                retryable: classify_status(status),
            });
        }
        Ok(response.bytes().await?)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedSegment {
    pub segment: Segment,
    pub path: PathBuf,
}

/// Segments fetched during one iteration.
#[derive(Debug, Clone)]
pub struct WorkingBatch {
    pub dir: PathBuf,
    /// Every segment the tracker handed out, fetched or not.
    pub tracked: Vec<Segment>,
    /// Successfully fetched segments in playback order.
    pub fetched: Vec<FetchedSegment>,
    /// Segments given up on.
    pub gaps: Vec<Segment>,
}

impl WorkingBatch {
    pub fn is_empty(&self) -> bool {
        self.fetched.is_empty()
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.fetched.iter().map(|f| f.path.clone()).collect()
    }

    /// Last tracked segment, the checkpoint candidate for this batch.
    pub fn last_tracked(&self) -> Option<&Segment> {
        self.tracked.last()
    }
}

pub struct SegmentFetcher {
    source: Arc<dyn SegmentSource>,
    policy: RetryPolicy,
}

impl SegmentFetcher {
    pub fn new(source: Arc<dyn SegmentSource>, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    /// Fetch one segment, retrying transient failures within the policy.
    pub async fn fetch(&self, segment: &Segment) -> Result<Bytes> {
        retry_with_backoff(&self.policy, &segment.uri, |_| self.source.fetch_segment(segment)).await
    }

    /// Fetch `segments` in order into `batch_dir` as `{index:05}.ts`.
    ///
    /// A segment that cannot be fetched is recorded as a gap and the batch
    /// continues.
    #[instrument(skip(self, segments), fields(segments = segments.len(), dir = %batch_dir.display()))]
    pub async fn fetch_batch(&self, segments: &[Segment], batch_dir: &Path) -> Result<WorkingBatch> {
        tokio::fs::create_dir_all(batch_dir)
            .await
            .map_err(|e| CaptureError::io_path("creating batch directory", batch_dir, e))?;

        let mut batch = WorkingBatch {
            dir: batch_dir.to_path_buf(),
            tracked: segments.to_vec(),
            fetched: Vec::with_capacity(segments.len()),
            gaps: Vec::new(),
        };

        for (index, segment) in segments.iter().enumerate() {
            let bytes = match self.fetch(segment).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(uri = %segment.uri, sequence = segment.sequence_index, error = %e, "Segment skipped");
                    batch.gaps.push(segment.clone());
                    continue;
                }
            };

            let path = batch_dir.join(format!("{index:05}.ts"));
            if let Err(e) = tokio::fs::write(&path, &bytes).await {
                warn!(path = %path.display(), error = %e, "Failed to store segment");
                batch.gaps.push(segment.clone());
                continue;
            }
            trace!(uri = %segment.uri, bytes = bytes.len(), duration = segment.duration, "Segment stored");
            batch.fetched.push(FetchedSegment {
                segment: segment.clone(),
                path,
            });
        }

        debug!(
            fetched = batch.fetched.len(),
            gaps = batch.gaps.len(),
            "Batch fetched"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Fails each uri a scripted number of times before serving it.
    struct FlakySource {
        failures: Mutex<HashMap<String, u32>>,
        permanent: Vec<String>,
    }

    #[async_trait]
    impl SegmentSource for FlakySource {
        async fn fetch_segment(&self, segment: &Segment) -> Result<Bytes> {
            if self.permanent.contains(&segment.uri) {
                return Err(CaptureError::SegmentFetch {
                    uri: segment.uri.clone(),
                    reason: "HTTP 404".into(),
                    retryable: false,
                });
            }
            let mut failures = self.failures.lock().unwrap();
            let left = failures.entry(segment.uri.clone()).or_insert(0);
            if *left > 0 {
                *left -= 1;
                return Err(CaptureError::SegmentFetch {
                    uri: segment.uri.clone(),
                    reason: "HTTP 503".into(),
                    retryable: true,
                });
            }
            Ok(Bytes::from(segment.uri.clone()))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_segment_becomes_gap_and_batch_continues() {
        let dir = tempfile::tempdir().unwrap();
        let source = FlakySource {
            failures: Mutex::new(HashMap::from([("b".to_string(), 2), ("c".to_string(), 5)])),
            permanent: vec!["d".to_string()],
        };
        let fetcher = SegmentFetcher::new(Arc::new(source), policy());
        let segments: Vec<_> = ["a", "b", "c", "d", "e"]
            .iter()
            .enumerate()
            .map(|(i, uri)| Segment::new(*uri, i as u64))
            .collect();

        let batch = fetcher
            .fetch_batch(&segments, &dir.path().join("batch-000001"))
            .await
            .unwrap();

        let fetched: Vec<_> = batch.fetched.iter().map(|f| f.segment.uri.as_str()).collect();
        assert_eq!(fetched, ["a", "b", "e"]);
        let gaps: Vec<_> = batch.gaps.iter().map(|s| s.uri.as_str()).collect();
        assert_eq!(gaps, ["c", "d"]);
        assert_eq!(batch.last_tracked().unwrap().uri, "e");

        // Files keep the position of the segment in the batch.
        assert!(batch.fetched[2].path.ends_with("00004.ts"));
        let stored = std::fs::read(&batch.fetched[1].path).unwrap();
        assert_eq!(stored, b"b");
    }

    #[tokio::test]
    async fn http_source_classifies_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x47u8; 188]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.ts"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy.ts"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let source = HttpSegmentSource::new(Client::new(), 1);
        let ok = source
            .fetch_segment(&Segment::new(format!("{}/ok.ts", server.uri()), 0))
            .await
            .unwrap();
        assert_eq!(ok.len(), 188);

        let missing = source
            .fetch_segment(&Segment::new(format!("{}/missing.ts", server.uri()), 1))
            .await
            .unwrap_err();
        assert!(!missing.is_retryable());

        let busy = source
            .fetch_segment(&Segment::new(format!("{}/busy.ts", server.uri()), 2))
            .await
            .unwrap_err();
        assert!(busy.is_retryable());
    }
}

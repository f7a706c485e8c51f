//! Blocking workers for the camera and the recognition models.
//!
//! Each worker owns its resource on a dedicated OS thread and is driven
//! through a tokio channel. The async side bounds every call with a timeout;
//! a call that times out is abandoned by dropping its reply channel, and the
//! worker's late answer is discarded.

use sentinel_core::{DetectedFace, RecognitionEngine, RecognitionError};
use sentinel_hw::{CaptureError, Frame, FrameSource};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Extra wait on top of the per-frame timeout before the async side gives up
/// on a slot the driver never reported.
const FRAME_GRACE: Duration = Duration::from_millis(250);

enum CaptureRequest {
    Open {
        reply: oneshot::Sender<Result<(), CaptureError>>,
    },
    Batch {
        max_count: usize,
        per_frame_timeout: Duration,
        frames: mpsc::Sender<Result<Frame, CaptureError>>,
        pulls: mpsc::Receiver<()>,
    },
    Release,
}

/// Clone-safe handle to the capture worker.
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::Sender<CaptureRequest>,
}

impl CaptureHandle {
    /// Open the camera, waiting at most `timeout` for the device to come up.
    pub async fn open(&self, timeout: Duration) -> Result<(), CaptureError> {
        let (reply, rx) = oneshot::channel();
        let call = async {
            self.tx
                .send(CaptureRequest::Open { reply })
                .await
                .map_err(|_| CaptureError::Unavailable("capture worker exited".into()))?;
            rx.await
                .map_err(|_| CaptureError::Unavailable("capture worker exited".into()))?
        };
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| CaptureError::Unavailable(format!("camera did not open within {timeout:?}")))?
    }

    /// Open the camera if needed and start a lazy batch of up to `max_count`
    /// frames. Frames are only captured as the returned [`FrameBatch`] is
    /// pulled; dropping it stops the batch. No slot waits past `deadline`.
    pub async fn acquire_frames(
        &self,
        max_count: usize,
        per_frame_timeout: Duration,
        deadline: Instant,
    ) -> Result<FrameBatch, CaptureError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.open(remaining).await?;

        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (pulls_tx, pulls_rx) = mpsc::channel(max_count.max(1));
        self.tx
            .send(CaptureRequest::Batch {
                max_count,
                per_frame_timeout,
                frames: frames_tx,
                pulls: pulls_rx,
            })
            .await
            .map_err(|_| CaptureError::Unavailable("capture worker exited".into()))?;

        Ok(FrameBatch {
            frames: frames_rx,
            pulls: pulls_tx,
            per_frame_timeout,
            deadline,
            remaining: max_count,
            delivered: 0,
        })
    }

    /// Ask the worker to close the device. Fire-and-forget.
    pub fn release(&self) {
        if self.tx.try_send(CaptureRequest::Release).is_err() {
            tracing::debug!("capture worker busy or gone, release skipped");
        }
    }
}

/// A bounded, lazily captured run of frames.
pub struct FrameBatch {
    frames: mpsc::Receiver<Result<Frame, CaptureError>>,
    pulls: mpsc::Sender<()>,
    per_frame_timeout: Duration,
    deadline: Instant,
    remaining: usize,
    delivered: usize,
}

impl FrameBatch {
    /// Next slot of the batch: a frame, a per-slot error, or `None` once the
    /// batch is exhausted, the deadline has passed, or the camera stopped.
    pub async fn next(&mut self) -> Option<Result<Frame, CaptureError>> {
        if self.remaining == 0 {
            return None;
        }
        let now = Instant::now();
        if now >= self.deadline {
            self.remaining = 0;
            return None;
        }
        if self.pulls.try_send(()).is_err() {
            self.remaining = 0;
            return None;
        }

        let wait_until = (now + self.per_frame_timeout + FRAME_GRACE).min(self.deadline);
        match tokio::time::timeout_at(wait_until, self.frames.recv()).await {
            Ok(Some(item)) => {
                self.remaining -= 1;
                if item.is_ok() {
                    self.delivered += 1;
                }
                Some(item)
            }
            Ok(None) => {
                self.remaining = 0;
                None
            }
            Err(_) if Instant::now() >= self.deadline => {
                self.remaining = 0;
                None
            }
            Err(_) => {
                self.remaining -= 1;
                Some(Err(CaptureError::Timeout(self.per_frame_timeout)))
            }
        }
    }

    /// Frames handed out so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }
}

/// Spawn the capture worker owning `source`.
pub fn spawn_capture_worker(mut source: Box<dyn FrameSource>) -> std::io::Result<CaptureHandle> {
    let (tx, mut rx) = mpsc::channel::<CaptureRequest>(4);

    std::thread::Builder::new()
        .name("sentinel-capture".into())
        .spawn(move || {
            tracing::info!("capture worker started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    CaptureRequest::Open { reply } => {
                        let _ = reply.send(source.open());
                    }
                    CaptureRequest::Batch {
                        max_count,
                        per_frame_timeout,
                        frames,
                        mut pulls,
                    } => {
                        // Nothing is captured until the consumer asks for it.
                        if pulls.blocking_recv().is_none() {
                            continue;
                        }
                        let mut sink = |item: Result<Frame, CaptureError>| {
                            frames.blocking_send(item).is_ok() && pulls.blocking_recv().is_some()
                        };
                        if let Err(e) = source.capture(max_count, per_frame_timeout, &mut sink) {
                            tracing::warn!(error = %e, "capture batch aborted");
                            let _ = frames.blocking_send(Err(e));
                        }
                    }
                    CaptureRequest::Release => source.release(),
                }
            }
            source.release();
            tracing::info!("capture worker exiting");
        })?;

    Ok(CaptureHandle { tx })
}

#[derive(Error, Debug)]
pub enum InferenceFailure {
    #[error(transparent)]
    Model(#[from] RecognitionError),
    #[error("inference did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("inference worker exited")]
    WorkerGone,
}

enum InferenceRequest {
    Recognize {
        frame: Frame,
        reply: oneshot::Sender<Result<Vec<DetectedFace>, RecognitionError>>,
    },
    Probe {
        reply: oneshot::Sender<Result<(), RecognitionError>>,
    },
}

/// Clone-safe handle to the inference worker.
#[derive(Clone)]
pub struct InferenceHandle {
    tx: mpsc::Sender<InferenceRequest>,
}

impl InferenceHandle {
    /// Detect and embed every face in `frame`.
    pub async fn recognize(
        &self,
        frame: Frame,
        timeout: Duration,
    ) -> Result<Vec<DetectedFace>, InferenceFailure> {
        let (reply, rx) = oneshot::channel();
        self.call(InferenceRequest::Recognize { frame, reply }, rx, timeout)
            .await
    }

    /// Push a blank frame through the models.
    pub async fn probe(&self, timeout: Duration) -> Result<(), InferenceFailure> {
        let (reply, rx) = oneshot::channel();
        self.call(InferenceRequest::Probe { reply }, rx, timeout).await
    }

    async fn call<T>(
        &self,
        request: InferenceRequest,
        rx: oneshot::Receiver<Result<T, RecognitionError>>,
        timeout: Duration,
    ) -> Result<T, InferenceFailure> {
        let call = async {
            self.tx
                .send(request)
                .await
                .map_err(|_| InferenceFailure::WorkerGone)?;
            let result = rx.await.map_err(|_| InferenceFailure::WorkerGone)?;
            result.map_err(InferenceFailure::from)
        };
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| InferenceFailure::TimedOut(timeout))?
    }
}

/// Spawn the inference worker owning `engine`.
pub fn spawn_inference_worker(mut engine: Box<dyn RecognitionEngine>) -> std::io::Result<InferenceHandle> {
    let (tx, mut rx) = mpsc::channel::<InferenceRequest>(2);

    std::thread::Builder::new()
        .name("sentinel-inference".into())
        .spawn(move || {
            tracing::info!("inference worker started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    InferenceRequest::Recognize { frame, reply } => {
                        // The requester may have given up while this was queued.
                        if reply.is_closed() {
                            continue;
                        }
                        let result = engine.detect_and_embed(&frame.data, frame.width, frame.height);
                        if let Err(e) = &result {
                            tracing::warn!(sequence = frame.sequence, error = %e, "inference failed");
                        }
                        let _ = reply.send(result);
                    }
                    InferenceRequest::Probe { reply } => {
                        let _ = reply.send(engine.probe());
                    }
                }
            }
            tracing::info!("inference worker exiting");
        })?;

    Ok(InferenceHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Camera that records how many frames it was asked to produce.
    struct CountingCamera {
        captured: Arc<Mutex<usize>>,
        fail_open: bool,
    }

    impl FrameSource for CountingCamera {
        fn open(&mut self) -> Result<(), CaptureError> {
            if self.fail_open {
                Err(CaptureError::Unavailable("unplugged".into()))
            } else {
                Ok(())
            }
        }

        fn capture(
            &mut self,
            max_count: usize,
            _per_frame_timeout: Duration,
            sink: &mut dyn FnMut(Result<Frame, CaptureError>) -> bool,
        ) -> Result<(), CaptureError> {
            for i in 0..max_count {
                *self.captured.lock().unwrap() += 1;
                if !sink(Ok(Frame::new(vec![0; 4], 2, 2, i as u32))) {
                    break;
                }
            }
            Ok(())
        }

        fn release(&mut self) {}
    }

    struct Stuck;

    impl RecognitionEngine for Stuck {
        fn detect_and_embed(
            &mut self,
            _frame: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, RecognitionError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Vec::new())
        }
    }

    struct Broken;

    impl RecognitionEngine for Broken {
        fn detect_and_embed(
            &mut self,
            _frame: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, RecognitionError> {
            Err(RecognitionError::InferenceFailed("bad tensor".into()))
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_batch_is_lazy() {
        let captured = Arc::new(Mutex::new(0));
        let handle = spawn_capture_worker(Box::new(CountingCamera {
            captured: captured.clone(),
            fail_open: false,
        }))
        .unwrap();

        let mut batch = handle
            .acquire_frames(3, Duration::from_millis(200), far_deadline())
            .await
            .unwrap();
        assert!(batch.next().await.unwrap().is_ok());
        assert!(batch.next().await.unwrap().is_ok());
        drop(batch);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*captured.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_batch_ends_after_max_count() {
        let handle = spawn_capture_worker(Box::new(CountingCamera {
            captured: Arc::new(Mutex::new(0)),
            fail_open: false,
        }))
        .unwrap();

        let mut batch = handle
            .acquire_frames(2, Duration::from_millis(200), far_deadline())
            .await
            .unwrap();
        assert!(batch.next().await.is_some());
        assert!(batch.next().await.is_some());
        assert!(batch.next().await.is_none());
        assert_eq!(batch.delivered(), 2);
    }

    #[tokio::test]
    async fn test_open_failure_is_unavailable() {
        let handle = spawn_capture_worker(Box::new(CountingCamera {
            captured: Arc::new(Mutex::new(0)),
            fail_open: true,
        }))
        .unwrap();

        let err = handle
            .acquire_frames(3, Duration::from_millis(200), far_deadline())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_inference_timeout() {
        let handle = spawn_inference_worker(Box::new(Stuck)).unwrap();
        let frame = Frame::new(vec![0; 4], 2, 2, 0);
        let err = handle
            .recognize(frame, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceFailure::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_inference_error_propagates() {
        let handle = spawn_inference_worker(Box::new(Broken)).unwrap();
        let frame = Frame::new(vec![0; 4], 2, 2, 0);
        let err = handle
            .recognize(frame, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceFailure::Model(RecognitionError::InferenceFailed(_))));
        assert!(handle.probe(Duration::from_secs(1)).await.is_err());
    }
}

//! Output relay: worker output in, pose messages out.
//!
//! One relay task runs per worker instance. It logs every line under the
//! `posebridge::worker` target, publishes each recognised pose, and ends when
//! the stream does. It never touches worker lifecycle state; every per-line
//! failure is logged and skipped.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::bus::PosePublisher;
use crate::line_codec::LineCodec;
use crate::pose::{PoseRecord, PoseTransform, pose_from_line};

/// Counters for one relay run, returned when the stream ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub lines: u64,
    pub poses_published: u64,
    pub parse_failures: u64,
    pub decode_failures: u64,
    pub publish_failures: u64,
}

#[derive(Clone)]
pub struct OutputRelay {
    publisher: Arc<dyn PosePublisher>,
    pose_topic: Arc<str>,
    transform: PoseTransform,
}

impl OutputRelay {
    pub fn new(
        publisher: Arc<dyn PosePublisher>,
        pose_topic: impl Into<Arc<str>>,
        transform: PoseTransform,
    ) -> Self {
        Self {
            publisher,
            pose_topic: pose_topic.into(),
            transform,
        }
    }

    pub fn pose_topic(&self) -> &str {
        &self.pose_topic
    }

    /// Consume `output` until end of stream.
    ///
    /// A read error (the pipe torn down under us) ends the run like EOF does.
    pub async fn run<R>(self, output: R) -> RelayStats
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = FramedRead::new(output, LineCodec::new());
        let mut stats = RelayStats::default();

        while let Some(next) = lines.next().await {
            match next {
                Ok(raw) => {
                    stats.lines += 1;
                    self.handle_line(&raw, &mut stats).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Worker output read failed, stopping relay");
                    break;
                }
            }
        }

        tracing::debug!(?stats, "Worker output closed");
        stats
    }

    async fn handle_line(&self, raw: &[u8], stats: &mut RelayStats) {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim(),
            Err(e) => {
                stats.decode_failures += 1;
                tracing::warn!(
                    error = %e,
                    line = %String::from_utf8_lossy(raw),
                    "Skipping undecodable worker output"
                );
                return;
            }
        };

        tracing::info!(target: "posebridge::worker", "{}", line);

        match pose_from_line(line, &self.transform) {
            Ok(Some(pose)) => self.publish(pose, stats).await,
            Ok(None) => {}
            Err(e) => {
                stats.parse_failures += 1;
                tracing::warn!(error = %e, %line, "Failed to parse pose line");
            }
        }
    }

    async fn publish(&self, pose: PoseRecord, stats: &mut RelayStats) {
        let payload = match pose.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                stats.publish_failures += 1;
                tracing::error!(error = %e, "Failed to encode pose");
                return;
            }
        };

        match self.publisher.publish(&self.pose_topic, payload).await {
            Ok(()) => {
                stats.poses_published += 1;
                tracing::info!(
                    target: "posebridge::pose",
                    x = pose.x,
                    y = pose.y,
                    topic = %self.pose_topic,
                    "Pose published"
                );
            }
            Err(e) => {
                stats.publish_failures += 1;
                tracing::warn!(error = %e, topic = %self.pose_topic, "Failed to publish pose");
            }
        }
    }
}

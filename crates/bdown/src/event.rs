use std::{fmt, path::PathBuf};

use tokio::sync::mpsc;

use crate::ErrorKind;

/// Stages of one pipeline run, in the order they execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Resolving,
    DownloadingVideo,
    DownloadingAudio,
    Muxing,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolving => "resolving",
            Self::DownloadingVideo => "downloading video",
            Self::DownloadingAudio => "downloading audio",
            Self::Muxing => "muxing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Stage(PipelineStage),
    Started {
        /// `None` when the server did not send a content length.
        total_bytes: Option<u64>,
        label: String,
    },
    Progress {
        bytes_read: u64,
        total_bytes: Option<u64>,
        /// KiB per second since the transfer started.
        speed_kbps: f64,
    },
    Completed {
        label: String,
        path: PathBuf,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Fire-and-forget sink for [DownloadEvent]s.
///
/// Sending never blocks and a dropped receiver is ignored, so the core never
/// waits on whoever is listening.
#[derive(Clone, Default)]
pub struct EventSender {
    inner: Option<mpsc::UnboundedSender<DownloadEvent>>,
    label_prefix: Option<String>,
    forward_terminal: bool,
}

impl EventSender {
    pub fn new(sender: mpsc::UnboundedSender<DownloadEvent>) -> Self {
        Self {
            inner: Some(sender),
            label_prefix: None,
            forward_terminal: true,
        }
    }

    /// Create a sender together with the receiving half.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// A sender that drops every event.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Derive a sender for a sub-task: labels get `"<prefix>: "` prepended and
    /// the sub-task's own terminal events are swallowed, leaving the terminal
    /// event of the run to the owner.
    pub fn stage(&self, prefix: impl fmt::Display) -> Self {
        Self {
            inner: self.inner.clone(),
            label_prefix: Some(prefix.to_string()),
            forward_terminal: false,
        }
    }

    pub fn send(&self, event: DownloadEvent) {
        let Some(sender) = &self.inner else {
            return;
        };
        if event.is_terminal() && !self.forward_terminal {
            return;
        }

        let event = match (event, &self.label_prefix) {
            (DownloadEvent::Started { total_bytes, label }, Some(prefix)) => {
                DownloadEvent::Started {
                    total_bytes,
                    label: format!("{prefix}: {label}"),
                }
            }
            (event, _) => event,
        };
        _ = sender.send(event);
    }

    pub fn stage_changed(&self, stage: PipelineStage) {
        self.send(DownloadEvent::Stage(stage));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_sender_prefixes_and_filters() {
        let (sender, mut rx) = EventSender::channel();
        let video = sender.stage("video");

        video.send(DownloadEvent::Started {
            total_bytes: Some(10),
            label: "a_video.m4s".to_string(),
        });
        video.send(DownloadEvent::Completed {
            label: "a_video.m4s".to_string(),
            path: PathBuf::from("a_video.m4s"),
        });
        sender.send(DownloadEvent::Completed {
            label: "a.mp4".to_string(),
            path: PathBuf::from("a.mp4"),
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            DownloadEvent::Started {
                total_bytes: Some(10),
                label: "video: a_video.m4s".to_string(),
            }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            DownloadEvent::Completed { label, .. } if label == "a.mp4"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (sender, rx) = EventSender::channel();
        drop(rx);
        sender.stage_changed(PipelineStage::Resolving);
        EventSender::noop().stage_changed(PipelineStage::Muxing);
    }
}

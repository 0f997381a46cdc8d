use thiserror::Error;

/// The `stage` at which a session-terminating failure occurred. Mirrors the
/// `stage` field carried on every `SnapshotFailedEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Hello,
    Auth,
    Capture,
    Proxy,
    Store,
    Unknown,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureStage::Hello => "hello",
            FailureStage::Auth => "auth",
            FailureStage::Capture => "capture",
            FailureStage::Proxy => "proxy",
            FailureStage::Store => "store",
            FailureStage::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Errors raised by the frame codec (C1). Decoding never panics; a malformed
/// buffer always turns into one of these instead.
#[derive(Debug, Error)]
pub enum FrameCodecError {
    #[error("empty binary frame")]
    EmptyFrame,
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
}

/// Errors raised while driving the ffmpeg snapshot subprocess (C6).
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("CAM_PASS required")]
    MissingCamPass,
    #[error("ffmpeg failed (exit {0})")]
    NonZeroExit(i32),
    #[error("ffmpeg failed (exit unknown)")]
    UnknownExit,
    /// The watchdog killed the process before it exited on its own. A killed
    /// process has no real exit code, so this reports the sentinel `-1` to
    /// keep the `error="ffmpeg failed (exit <code>)"` shape the specification
    /// mandates for every capture failure, watchdog kills included.
    #[error("ffmpeg failed (exit -1)")]
    TimedOut,
    #[error("ffmpeg produced no output file")]
    MissingOutput,
    #[error("ffmpeg output file is empty")]
    EmptyOutput,
    #[error("global capture already in progress")]
    AlreadyCapturing,
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(#[from] std::io::Error),
}

impl CaptureError {
    /// The `error` string placed on a `SnapshotFailedEvent`, matching the
    /// exact wording the specification mandates for a watchdog kill.
    pub fn as_event_message(&self) -> String {
        match self {
            CaptureError::NonZeroExit(code) => format!("ffmpeg failed (exit {code})"),
            CaptureError::UnknownExit => "ffmpeg failed (exit unknown)".to_string(),
            CaptureError::TimedOut => "ffmpeg failed (exit -1)".to_string(),
            CaptureError::AlreadyCapturing => "Global capture already in progress".to_string(),
            other => other.to_string(),
        }
    }
}

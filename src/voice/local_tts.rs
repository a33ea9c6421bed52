//! On-device speech synthesis
//!
//! Used when remote synthesis is unavailable or fails. Completion is reported
//! per utterance id; the tracker drops reports for anything but the pending id.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::SynthesisError;

/// Programs tried, in order, when looking for a system voice
const CANDIDATE_PROGRAMS: &[&str] = &["espeak-ng", "espeak", "say"];

/// Text to audible speech without the network
#[async_trait]
pub trait LocalSynthesizer: Send + Sync {
    /// Speak `text`, resolving once the utterance is done
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires first, otherwise `Local` or
    /// `Unavailable` when the engine fails
    async fn speak(&self, text: &str, cancel: CancellationToken) -> Result<(), SynthesisError>;
}

/// Completion report from a synthesis engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtteranceEvent {
    /// Utterance finished playing
    Done(u64),
    /// Utterance failed
    Error(u64, String),
}

impl UtteranceEvent {
    /// Utterance id this event refers to
    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::Done(id) | Self::Error(id, _) => *id,
        }
    }
}

struct Pending {
    id: u64,
    done: oneshot::Sender<Result<(), String>>,
}

/// Single-slot completion signal keyed by utterance id
#[derive(Default)]
pub struct UtteranceTracker {
    next_id: AtomicU64,
    pending: Mutex<Option<Pending>>,
}

impl UtteranceTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new utterance, superseding any pending one
    pub fn begin(&self) -> (u64, oneshot::Receiver<Result<(), String>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(Pending { id, done: tx });
        }
        (id, rx)
    }

    /// Deliver an engine event; returns false if it was stale
    pub fn complete(&self, event: UtteranceEvent) -> bool {
        let Ok(mut slot) = self.pending.lock() else {
            return false;
        };

        if slot.as_ref().map(|p| p.id) != Some(event.id()) {
            tracing::debug!(id = event.id(), "ignoring stale utterance event");
            return false;
        }

        let Some(pending) = slot.take() else {
            return false;
        };
        let outcome = match event {
            UtteranceEvent::Done(_) => Ok(()),
            UtteranceEvent::Error(_, reason) => Err(reason),
        };
        let _ = pending.done.send(outcome);
        true
    }

    /// Forget `id` if it is still the pending utterance
    pub fn abandon(&self, id: u64) {
        if let Ok(mut slot) = self.pending.lock()
            && slot.as_ref().is_some_and(|p| p.id == id)
        {
            *slot = None;
        }
    }

    /// Id of the utterance currently awaited
    #[must_use]
    pub fn pending_id(&self) -> Option<u64> {
        self.pending
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|p| p.id))
    }
}

/// System voice driven through a command-line synthesizer
pub struct CommandSynthesizer {
    program: PathBuf,
    tracker: Arc<UtteranceTracker>,
}

impl CommandSynthesizer {
    /// Use a specific synthesizer program; `text` is passed as its only argument
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            tracker: Arc::new(UtteranceTracker::new()),
        }
    }

    /// Find the first installed system synthesizer
    #[must_use]
    pub fn detect() -> Option<Self> {
        CANDIDATE_PROGRAMS.iter().find_map(|name| {
            which::which(name).ok().map(|path| {
                tracing::debug!(program = %path.display(), "local synthesizer found");
                Self::with_program(path)
            })
        })
    }

    /// Path of the synthesizer program
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl LocalSynthesizer for CommandSynthesizer {
    async fn speak(&self, text: &str, cancel: CancellationToken) -> Result<(), SynthesisError> {
        let (id, done) = self.tracker.begin();

        let mut child = tokio::process::Command::new(&self.program)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.tracker.abandon(id);
                SynthesisError::Local(format!("{}: {e}", self.program.display()))
            })?;

        let tracker = Arc::clone(&self.tracker);
        let child_cancel = cancel.clone();
        tokio::spawn(async move {
            let event = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => UtteranceEvent::Done(id),
                    Ok(status) => UtteranceEvent::Error(id, format!("exited with {status}")),
                    Err(e) => UtteranceEvent::Error(id, e.to_string()),
                },
                () = child_cancel.cancelled() => {
                    let _ = child.kill().await;
                    UtteranceEvent::Error(id, "interrupted".to_string())
                }
            };
            tracker.complete(event);
        });

        tokio::select! {
            outcome = done => match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) if cancel.is_cancelled() => Err(SynthesisError::Cancelled),
                Ok(Err(reason)) => Err(SynthesisError::Local(reason)),
                // Superseded by a newer utterance
                Err(_) => Err(SynthesisError::Cancelled),
            },
            () = cancel.cancelled() => {
                self.tracker.abandon(id);
                Err(SynthesisError::Cancelled)
            }
        }
    }
}

/// Stand-in when no system voice is installed
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLocalSynthesizer;

#[async_trait]
impl LocalSynthesizer for NoLocalSynthesizer {
    async fn speak(&self, _text: &str, _cancel: CancellationToken) -> Result<(), SynthesisError> {
        Err(SynthesisError::Unavailable(
            "no system voice installed".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_completion_ignored() {
        let tracker = UtteranceTracker::new();
        let (first, _first_rx) = tracker.begin();
        let (second, mut second_rx) = tracker.begin();
        assert_ne!(first, second);

        assert!(!tracker.complete(UtteranceEvent::Done(first)));
        assert_eq!(tracker.pending_id(), Some(second));
        assert!(second_rx.try_recv().is_err());

        assert!(tracker.complete(UtteranceEvent::Done(second)));
        assert_eq!(second_rx.try_recv().unwrap(), Ok(()));
        assert_eq!(tracker.pending_id(), None);
    }

    #[test]
    fn test_superseded_receiver_closes() {
        let tracker = UtteranceTracker::new();
        let (_, mut first_rx) = tracker.begin();
        let _ = tracker.begin();
        assert!(matches!(
            first_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_error_event_delivered() {
        let tracker = UtteranceTracker::new();
        let (id, mut rx) = tracker.begin();
        assert!(tracker.complete(UtteranceEvent::Error(id, "engine died".to_string())));
        assert_eq!(rx.try_recv().unwrap(), Err("engine died".to_string()));
    }

    #[test]
    fn test_abandon_only_matching_id() {
        let tracker = UtteranceTracker::new();
        let (first, _) = tracker.begin();
        let (second, _) = tracker.begin();
        tracker.abandon(first);
        assert_eq!(tracker.pending_id(), Some(second));
        tracker.abandon(second);
        assert_eq!(tracker.pending_id(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_success_and_failure() {
        let ok = CommandSynthesizer::with_program("true");
        assert!(ok.speak("hello", CancellationToken::new()).await.is_ok());

        let failing = CommandSynthesizer::with_program("false");
        let err = failing
            .speak("hello", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::Local(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_cancel() {
        let synth = CommandSynthesizer::with_program("sleep");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = synth.speak("10", cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_missing_program_is_local_error() {
        let synth = CommandSynthesizer::with_program("/nonexistent/beacon-voice");
        let err = synth
            .speak("hi", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::Local(_)));
        assert_eq!(synth.tracker.pending_id(), None);
    }
}

//! Audio device capabilities
//!
//! The talk pipeline only talks to hardware through these traits. The cpal
//! bindings in this module tree implement them for desktop hosts; tests swap
//! in in-memory fakes.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::voice::{AudioFrame, StreamReader};

/// Opens microphone capture
pub trait AudioInput: Send + Sync {
    /// Whether the process may record audio
    fn has_permission(&self) -> bool {
        true
    }

    /// Open a capture stream producing fixed-size frames
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` or `DeviceUnavailable` if capture cannot start
    fn open(&self) -> Result<Box<dyn AudioSource>>;
}

/// Pull-based frame stream from a capture device
#[async_trait]
pub trait AudioSource: Send {
    /// Wait for the next frame; `None` once the source has ended
    ///
    /// # Errors
    ///
    /// Returns error if the device fails mid-stream
    async fn next_frame(&mut self) -> Result<Option<AudioFrame>>;

    /// Stop capturing and release the device
    fn close(&mut self) {}
}

/// Opens PCM output streams
pub trait AudioOutput: Send + Sync {
    /// Open a mono 16-bit output stream at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no suitable output exists
    fn open_pcm(&self, sample_rate: u32) -> Result<Box<dyn AudioSink>>;
}

/// Push-based PCM output stream
#[async_trait]
pub trait AudioSink: Send {
    /// Queue little-endian 16-bit PCM, returning the number of bytes accepted
    ///
    /// # Errors
    ///
    /// Returns error if the device rejected the write
    async fn write(&mut self, pcm: &[u8]) -> Result<usize>;

    /// Wait until queued audio has been played out
    ///
    /// # Errors
    ///
    /// Returns error if the device failed while draining
    async fn drain(&mut self) -> Result<()>;

    /// Pause, flush, stop and release; never fails
    fn stop(&mut self);
}

/// Buffered streaming decoder + player for compressed audio
#[async_trait]
pub trait CompressedAudioPlayer: Send + Sync {
    /// Decode and play `source` until it ends, fails, or `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns error if decoding or the output device fails
    async fn play(&self, source: StreamReader, cancel: CancellationToken) -> Result<()>;
}

/// Transient exclusive claim on audio output
pub trait AudioFocus: Send + Sync {
    /// Take focus before playback
    fn request(&self);

    /// Give focus back after playback is torn down
    fn abandon(&self);
}

/// In-process focus token
#[derive(Debug, Default)]
pub struct ExclusiveFocus {
    held: AtomicBool,
}

impl ExclusiveFocus {
    /// Create an unheld token
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Whether focus is currently held
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl AudioFocus for ExclusiveFocus {
    fn request(&self) {
        if !self.held.swap(true, Ordering::SeqCst) {
            tracing::trace!("audio focus acquired");
        }
    }

    fn abandon(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            tracing::trace!("audio focus released");
        }
    }
}

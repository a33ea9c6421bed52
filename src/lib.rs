//! Beacon Talk - hands-free voice conversation with a Beacon agent
//!
//! This library provides the talk mode pipeline:
//! - Voice activity segmentation of microphone capture
//! - Transcription of finished utterances
//! - Agent dispatch and reply collection over the gateway
//! - Streaming speech synthesis with an on-device fallback
//! - Barge-in: speaking over the assistant interrupts it
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    TalkMode                          │
//! │   Listening → Transcribing → Awaiting → Speaking    │
//! └──────┬───────────────┬───────────────┬──────────────┘
//!        │               │               │
//! ┌──────▼──────┐ ┌──────▼──────┐ ┌──────▼──────────────┐
//! │   voice     │ │   agent     │ │   speech player     │
//! │ capture/VAD │ │ gateway RPC │ │ PCM / MP3 / system  │
//! └─────────────┘ └─────────────┘ └─────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod talk;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result, SynthesisError};
pub use talk::{TalkMode, TalkParts, TalkStatus};

//! Voice processing module
//!
//! Device-facing half of talk mode: frame capture, voice activity
//! segmentation, PCM playback, compressed stream playback and the on-device
//! synthesizer. Everything above this layer talks to hardware through the
//! traits in [`device`].

mod capture;
mod device;
mod frame;
mod local_tts;
mod playback;
mod segmenter;
mod stream_buffer;
mod wav;

pub use capture::{MicrophoneInput, MicrophoneSource};
pub use device::{
    AudioFocus, AudioInput, AudioOutput, AudioSink, AudioSource, CompressedAudioPlayer,
    ExclusiveFocus,
};
pub use frame::{AudioFrame, FRAME_MS, FRAME_SAMPLES, SAMPLE_RATE, rms};
pub use local_tts::{
    CommandSynthesizer, LocalSynthesizer, NoLocalSynthesizer, UtteranceEvent, UtteranceTracker,
};
pub use playback::{Mp3Player, SpeakerOutput, SpeakerSink};
pub use segmenter::{BargeInDetector, Segmenter, SegmenterEvent, SpeechSegment};
pub use stream_buffer::{StreamReader, StreamWriter, stream_buffer};
pub use wav::{pcm_to_samples, pcm_to_wav, samples_to_pcm};

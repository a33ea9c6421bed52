use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_talk::config::{EnvFallbacks, TalkSettings};
use beacon_talk::talk::{
    GatewayClient, SessionVoiceState, SpeakOutcome, SpeakProgress, SpeechPlayer, TtsClient,
    speak_reply,
};
use beacon_talk::voice::{
    AudioInput, AudioOutput, BargeInDetector, CommandSynthesizer, ExclusiveFocus,
    LocalSynthesizer, MicrophoneInput, Mp3Player, NoLocalSynthesizer, SpeakerOutput,
    samples_to_pcm,
};
use beacon_talk::{Config, TalkMode, TalkParts};

/// Beacon Talk - hands-free voice conversation with a Beacon agent
#[derive(Parser)]
#[command(name = "beacon-talk", version, about)]
struct Cli {
    /// Gateway URL (overrides talk.toml)
    #[arg(long, env = "BEACON_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Session to talk to; pins it against gateway config
    #[arg(short, long, env = "BEACON_SESSION_KEY")]
    session: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Run talk mode until interrupted (default)
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Speak text the same way talk mode speaks a reply
    TestTts {
        /// Text to speak; may start with a JSON directive line
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// List the voices available to the synthesis API key
    Voices,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_talk=info",
        1 => "info,beacon_talk=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load();
    if let Some(url) = cli.gateway_url {
        config.gateway_url = url;
    }
    if let Some(session) = cli.session {
        config.session_key = Some(session);
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => talk(config).await,
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(&config, &text).await,
        Command::Voices => voices(&config).await,
    }
}

/// Build the speech player on the default output device
fn build_player(config: &Config) -> anyhow::Result<Arc<SpeechPlayer>> {
    let tts = TtsClient::new(config.talk.base_url.clone(), &config.timeouts)?;
    let local: Arc<dyn LocalSynthesizer> = match CommandSynthesizer::detect() {
        Some(synth) => {
            tracing::debug!(program = %synth.program().display(), "system voice found");
            Arc::new(synth)
        }
        None => {
            tracing::debug!("no system voice found");
            Arc::new(NoLocalSynthesizer)
        }
    };

    Ok(Arc::new(SpeechPlayer::new(
        tts,
        Arc::new(SpeakerOutput::new()),
        Arc::new(Mp3Player::new()),
        local,
        Arc::new(ExclusiveFocus::new()),
        config.timeouts.local_tts,
    )))
}

/// Run talk mode until Ctrl-C or the microphone goes away
async fn talk(config: Config) -> anyhow::Result<()> {
    tracing::info!(gateway = %config.gateway_url, "starting beacon talk");

    let gateway = Arc::new(
        GatewayClient::new(&config.gateway_url).with_auth_token(config.gateway_token.clone()),
    );
    let player = build_player(&config)?;
    let parts = TalkParts {
        input: Arc::new(MicrophoneInput::new(&config.segmenter)),
        transport: gateway.clone(),
        config_source: Some(gateway),
        player,
    };

    let talk = TalkMode::new(config, parts)?;
    let mut status = talk.status();
    talk.enable()?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let stopped = talk.stopped();
    tokio::pin!(stopped);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutting down");
                break;
            }
            () = &mut stopped => {
                let current = talk.current_status();
                tracing::info!(state = ?current.state, "talk mode stopped: {}", current.status_text);
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                tracing::info!(state = ?current.state, "{}", current.status_text);
            }
        }
    }

    talk.disable().await;
    Ok(())
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let input = MicrophoneInput::new(&config.segmenter);
    let mut source = input.open()?;
    println!("Sample rate: {} Hz", input.sample_rate());
    println!("---");

    let started = Instant::now();
    let mut second = 1;
    let mut peak_rms = 0;
    while started.elapsed() < Duration::from_secs(duration) {
        let Some(frame) = source.next_frame().await? else {
            println!("capture ended");
            break;
        };
        peak_rms = peak_rms.max(frame.rms());

        if started.elapsed() >= Duration::from_secs(second) {
            // Visual meter, full scale at 3000
            let meter_len = (peak_rms / 60).min(50) as usize;
            let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);
            println!("[{second:2}s] Peak RMS: {peak_rms:5} | [{meter}]");
            second += 1;
            peak_rms = 0;
        }
    }
    source.close();

    println!("\n---");
    let barge_in = BargeInDetector::new(&config.segmenter);
    println!(
        "Speech is detected above RMS {}; barge-in above {}.",
        config.segmenter.speech_rms_threshold,
        barge_in.threshold()
    );
    println!("If the meter stayed empty, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24_000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    let samples: Vec<i16> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            // 30% volume
            ((2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 * f32::from(i16::MAX)) as i16
        })
        .collect();

    println!("Playing {} samples at {sample_rate} Hz...", samples.len());

    let mut sink = SpeakerOutput::new().open_pcm(sample_rate)?;
    let pcm = samples_to_pcm(&samples);
    let mut offset = 0;
    while offset < pcm.len() {
        offset += sink.write(&pcm[offset..]).await?;
    }
    sink.drain().await?;
    sink.stop();

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Speak text through the reply path
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let env = EnvFallbacks::from_env(&config.talk);
    let voice = tokio::sync::Mutex::new(SessionVoiceState::new(&TalkSettings::from_local(
        &config.talk,
        &env,
    )));
    let player = build_player(config)?;

    let outcome = speak_reply(&player, &voice, text, |progress| match progress {
        SpeakProgress::Text(text) => println!("Speaking: {text}"),
        SpeakProgress::Speaking { fallback: true } => println!("Using the system voice"),
        SpeakProgress::Speaking { fallback: false } => println!("Streaming from the synthesis API"),
        SpeakProgress::Failed(status) => println!("{status}"),
    })
    .await;

    match outcome {
        SpeakOutcome::Spoken(path) => {
            println!("\n---");
            println!("Played via {path:?}. If you heard the speech, TTS is working!");
            Ok(())
        }
        SpeakOutcome::Empty => {
            println!("Nothing to say after the directive line");
            Ok(())
        }
        SpeakOutcome::Interrupted => anyhow::bail!("playback interrupted"),
        SpeakOutcome::Failed(e) => Err(e.into()),
    }
}

/// List synthesis voices
async fn voices(config: &Config) -> anyhow::Result<()> {
    let env = EnvFallbacks::from_env(&config.talk);
    let api_key = env
        .api_key
        .ok_or_else(|| anyhow::anyhow!("ELEVENLABS_API_KEY is not set"))?;

    let tts = TtsClient::new(config.talk.base_url.clone(), &config.timeouts)?;
    let voices = tts.list_voices(&api_key).await?;
    if voices.is_empty() {
        println!("No voices available");
    }
    for voice in voices {
        println!(
            "{}  {}",
            voice.voice_id,
            voice.name.as_deref().unwrap_or("(unnamed)")
        );
    }

    Ok(())
}

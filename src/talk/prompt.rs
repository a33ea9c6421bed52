//! Prompt assembly for spoken turns

use std::time::Duration;

/// Lines prepended to every spoken transcript
const PREAMBLE: [&str; 2] = [
    "Talk Mode active. Reply in a concise, spoken tone.",
    "You may optionally prefix the response with JSON (first line) to set ElevenLabs voice (id or alias), e.g. {\"voice\":\"<id>\",\"once\":true}.",
];

/// Wrap a transcript in the talk-mode preamble
///
/// `interrupted_at` is how far the previous reply got before the user cut it
/// off, if they did.
#[must_use]
pub fn build_prompt(transcript: &str, interrupted_at: Option<Duration>) -> String {
    let mut lines: Vec<String> = PREAMBLE.iter().map(ToString::to_string).collect();
    if let Some(offset) = interrupted_at {
        lines.push(format!(
            "Assistant speech interrupted at {:.1}s.",
            offset.as_secs_f64()
        ));
    }
    lines.push(String::new());
    lines.push(transcript.to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_prompt() {
        let prompt = build_prompt("What's the weather", None);
        let lines: Vec<&str> = prompt.lines().collect();
        assert_eq!(lines[0], "Talk Mode active. Reply in a concise, spoken tone.");
        assert!(lines[1].contains("{\"voice\":\"<id>\",\"once\":true}"));
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], "What's the weather");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_interrupted_prompt() {
        let prompt = build_prompt("stop", Some(Duration::from_millis(2340)));
        assert!(prompt.contains("\nAssistant speech interrupted at 2.3s.\n\nstop"));
    }
}

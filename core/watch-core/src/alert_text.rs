//! One-sentence alert text for the deterministic alert path.
//!
//! A model may phrase the sentence, but its output only survives the
//! direction guardrail; every other outcome resolves to the fixed template.
//! Nothing here returns an error.

use crate::config::AlertConfig;
use crate::error::Result;

/// Collaborator that turns a prompt into free text.
pub trait TextGenerator: Send {
    fn generate_text(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertText {
    /// Model output that passed the guardrail.
    Generated(String),
    /// Deterministic template.
    Fallback(String),
}

impl AlertText {
    pub fn text(&self) -> &str {
        match self {
            AlertText::Generated(text) | AlertText::Fallback(text) => text,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            AlertText::Generated(text) | AlertText::Fallback(text) => text,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, AlertText::Fallback(_))
    }
}

pub struct AlertTextGenerator {
    salutation: String,
    object_noun: String,
    generator: Option<Box<dyn TextGenerator>>,
}

impl AlertTextGenerator {
    pub fn new(config: &AlertConfig, generator: Option<Box<dyn TextGenerator>>) -> Self {
        Self {
            salutation: config.salutation.clone(),
            object_noun: config.object_noun.clone(),
            generator,
        }
    }

    /// Template-only generator.
    pub fn deterministic(config: &AlertConfig) -> Self {
        Self::new(config, None)
    }

    pub fn generate(&self, baseline: u32, observed: u32, diff: i64) -> AlertText {
        let fallback = || AlertText::Fallback(self.fallback_text(diff));
        if diff == 0 {
            return fallback();
        }
        let Some(generator) = self.generator.as_ref() else {
            return fallback();
        };

        let prompt = self.prompt(baseline, observed, diff);
        match generator.generate_text(&prompt) {
            Ok(text) => {
                let text = text.trim();
                if passes_guardrail(text, diff) {
                    AlertText::Generated(text.to_string())
                } else {
                    tracing::debug!(diff, text, "Generated alert text rejected by guardrail");
                    fallback()
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Alert text generation failed; using template");
                fallback()
            }
        }
    }

    pub fn fallback_text(&self, diff: i64) -> String {
        let salutation = &self.salutation;
        let noun = &self.object_noun;
        match diff {
            -1 => format!("{}, one {} was removed.", salutation, noun),
            d if d < -1 => format!("{}, {} {}s were removed.", salutation, d.unsigned_abs(), noun),
            1 => format!("{}, one {} was added.", salutation, noun),
            d if d > 1 => format!("{}, {} {}s were added.", salutation, d, noun),
            _ => format!("{}, {} count is unchanged.", salutation, noun),
        }
    }

    fn prompt(&self, baseline: u32, observed: u32, diff: i64) -> String {
        format!(
            "You generate one short inventory alert sentence. \
             Do not invent counts. \
             Baseline={}, Observed={}, Diff={}. \
             Use this exact salutation: {}. \
             Respond with one sentence only.",
            baseline, observed, diff, self.salutation
        )
    }
}

fn passes_guardrail(text: &str, diff: i64) -> bool {
    if text.is_empty() {
        return false;
    }
    let lowered = text.to_lowercase();
    if diff < 0 {
        lowered.contains("remove")
    } else if diff > 0 {
        lowered.contains("add")
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WatchError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        reply: std::result::Result<String, String>,
        calls: Arc<AtomicUsize>,
    }

    impl TextGenerator for Scripted {
        fn generate_text(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(WatchError::LlmResponse)
        }
    }

    fn with_reply(reply: std::result::Result<&str, &str>) -> (AlertTextGenerator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = Scripted {
            reply: reply.map(str::to_string).map_err(str::to_string),
            calls: Arc::clone(&calls),
        };
        (
            AlertTextGenerator::new(&AlertConfig::default(), Some(Box::new(generator))),
            calls,
        )
    }

    #[test]
    fn failing_collaborator_falls_back_to_plural_removed() {
        let (generator, calls) = with_reply(Err("connection refused"));
        let text = generator.generate(10, 7, -3);
        assert_eq!(
            text,
            AlertText::Fallback("Mr. Richard, 3 chairs were removed.".to_string())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unavailable_collaborator_falls_back_to_singular_added() {
        let generator = AlertTextGenerator::deterministic(&AlertConfig::default());
        assert_eq!(
            generator.generate(5, 6, 1).into_text(),
            "Mr. Richard, one chair was added."
        );
    }

    #[test]
    fn unchanged_never_calls_collaborator() {
        let (generator, calls) = with_reply(Ok("Mr. Richard, nothing was added."));
        let text = generator.generate(5, 5, 0);
        assert_eq!(
            text,
            AlertText::Fallback("Mr. Richard, chair count is unchanged.".to_string())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn accepts_text_with_matching_direction() {
        let (generator, _) = with_reply(Ok("  Mr. Richard, two chairs were Removed from the stage. "));
        assert_eq!(
            generator.generate(4, 2, -2),
            AlertText::Generated("Mr. Richard, two chairs were Removed from the stage.".to_string())
        );
    }

    #[test]
    fn rejects_text_with_wrong_direction() {
        let (generator, _) = with_reply(Ok("Mr. Richard, a chair was added."));
        let text = generator.generate(4, 3, -1);
        assert!(text.is_fallback());
        assert_eq!(text.text(), "Mr. Richard, one chair was removed.");

        let (generator, _) = with_reply(Ok("Mr. Richard, chairs were removed."));
        assert_eq!(
            generator.generate(4, 6, 2).into_text(),
            "Mr. Richard, 2 chairs were added."
        );
    }

    #[test]
    fn rejects_empty_text() {
        let (generator, _) = with_reply(Ok("   "));
        assert!(generator.generate(4, 5, 1).is_fallback());
    }

    #[test]
    fn template_uses_configured_wording() {
        let config = AlertConfig {
            salutation: "Team".to_string(),
            object_noun: "cup".to_string(),
        };
        let generator = AlertTextGenerator::deterministic(&config);
        assert_eq!(generator.fallback_text(-1), "Team, one cup was removed.");
        assert_eq!(generator.fallback_text(4), "Team, 4 cups were added.");
    }
}

use serde::{Deserialize, Serialize};

use super::ModelCost;

/// How a provider's input size maps onto metering tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenizerKind {
    /// Flat per-call pricing (image, video, music, speech). Input size is
    /// irrelevant; the estimate is the model's per-message token cost.
    PerMessage,
    /// Priced per character of input.
    Characters { chars_per_token: f64 },
    /// Priced per whitespace-separated word of input.
    Words { tokens_per_word: f64 },
}

impl TokenizerKind {
    pub const fn characters(chars_per_token: f64) -> Self {
        Self::Characters { chars_per_token }
    }

    pub const fn words(tokens_per_word: f64) -> Self {
        Self::Words { tokens_per_word }
    }
}

impl Default for TokenizerKind {
    fn default() -> Self {
        Self::characters(4.0)
    }
}

/// Model-specific token estimate for `text`. Text-priced models never
/// estimate below one token.
pub fn estimate_tokens(text: &str, cost: &ModelCost) -> u64 {
    match cost.tokenizer {
        TokenizerKind::PerMessage => cost.tokens_per_message,
        TokenizerKind::Characters { chars_per_token } => {
            let chars = text.chars().count() as f64;
            ratio_ceil(chars / chars_per_token.max(f64::EPSILON))
        }
        TokenizerKind::Words { tokens_per_word } => {
            let words = text.split_whitespace().count() as f64;
            ratio_ceil(words * tokens_per_word)
        }
    }
}

fn ratio_ceil(value: f64) -> u64 {
    (value.ceil() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_character_estimate() {
        let cost = ModelCost::new("openai", dec!(0.01), TokenizerKind::characters(4.0));
        assert_eq!(estimate_tokens("abcdefghij", &cost), 3);
        assert_eq!(estimate_tokens("", &cost), 1);
    }

    #[test]
    fn test_word_estimate() {
        let cost = ModelCost::new("moonshot", dec!(0.002), TokenizerKind::words(1.3));
        // 4 words * 1.3 = 5.2
        assert_eq!(estimate_tokens("write me a poem", &cost), 6);
    }

    #[test]
    fn test_per_message_ignores_input() {
        let cost = ModelCost::new("google", dec!(1.20), TokenizerKind::PerMessage);
        assert_eq!(estimate_tokens("a cat", &cost), 1_200_000);
        assert_eq!(
            estimate_tokens(&"long prompt ".repeat(500), &cost),
            1_200_000
        );
    }
}

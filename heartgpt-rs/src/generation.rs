//! Text generation for the inference smoke tests.

use candle_core::{IndexOp, Tensor};
use candle_transformers::generation::LogitsProcessor;
use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;
use crate::error::{HeartGptError, Result};
use crate::llama::Llama;
use crate::model::TextTokenizer;

/// One generated sequence, shaped like a text-generation pipeline result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// The prompt followed by the generated continuation.
    pub generated_text: String,
}

/// Autoregressive sampler over a borrowed model.
pub struct TextGenerator<'a> {
    model: &'a Llama,
    tokenizer: &'a TextTokenizer,
    config: GenerationConfig,
}

impl<'a> TextGenerator<'a> {
    /// Create a generator.
    #[must_use]
    pub fn new(model: &'a Llama, tokenizer: &'a TextTokenizer, config: GenerationConfig) -> Self {
        Self {
            model,
            tokenizer,
            config,
        }
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Continue `prompt` until eos or `max_length` total tokens.
    ///
    /// The returned text starts with `prompt` verbatim.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenisation or a forward pass fails.
    pub fn generate(&self, prompt: &str) -> Result<Vec<Generation>> {
        let prompt_ids = self.tokenizer.encode(prompt, true)?;
        if prompt_ids.is_empty() {
            return Err(HeartGptError::Generation("prompt encodes to no tokens".into()));
        }
        let limit = self
            .config
            .max_length
            .min(self.model.config().max_position_embeddings);

        let mut tokens = prompt_ids.clone();
        if tokens.len() >= limit {
            tracing::warn!(
                "prompt is {} tokens, max_length {} leaves no room to generate",
                tokens.len(),
                limit
            );
        } else {
            self.sample_into(&mut tokens, limit)?;
        }

        let generated = tokens.len() - prompt_ids.len();
        tracing::debug!("Generated {} tokens", generated);

        // Strip the decoded prompt from the decoded sequence, then re-attach
        // the prompt as given so whitespace and special tokens survive.
        let full = self.tokenizer.decode(&tokens, true)?;
        let prompt_text = self.tokenizer.decode(&prompt_ids, true)?;
        let tail = continuation(&full, &prompt_text, || {
            self.tokenizer.decode(&tokens[prompt_ids.len()..], true)
        })?;
        Ok(vec![Generation {
            generated_text: format!("{prompt}{tail}"),
        }])
    }

    fn sample_into(&self, tokens: &mut Vec<u32>, limit: usize) -> Result<()> {
        let mut processor = LogitsProcessor::new(self.config.seed, self.config.temperature, self.config.top_p);
        let mut cache = self.model.new_cache(true)?;
        let device = self.model.device();
        let eos = self.tokenizer.eos_id();
        let prompt_len = tokens.len();

        let mut index_pos = 0;
        while tokens.len() < limit {
            let context = if index_pos == 0 {
                &tokens[..]
            } else {
                &tokens[tokens.len() - 1..]
            };
            let input = Tensor::new(context, device)?.unsqueeze(0)?;
            let logits = self.model.forward_last(&input, index_pos, &mut cache)?.i(0)?;
            index_pos += context.len();

            let logits = if (self.config.repeat_penalty - 1.0).abs() > f32::EPSILON {
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    self.config.repeat_penalty,
                    &tokens[prompt_len..],
                )?
            } else {
                logits
            };

            let next = processor.sample(&logits)?;
            tokens.push(next);
            if next == eos {
                break;
            }
        }
        Ok(())
    }
}

/// Decoded text after the prompt.
///
/// Uses `decode_new` on the generated ids alone when the decoded prompt is
/// not a prefix of the full decode.
fn continuation(
    full: &str,
    prompt_text: &str,
    decode_new: impl FnOnce() -> Result<String>,
) -> Result<String> {
    match full.strip_prefix(prompt_text) {
        Some(rest) => Ok(rest.to_string()),
        None => {
            tracing::debug!("decoded prompt is not a prefix of the output; decoding new tokens only");
            decode_new()
        }
    }
}

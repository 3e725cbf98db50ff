use tracing::warn;

/// Fit a tokenized prompt to the text encoder's context window.
///
/// Short prompts are padded with `pad_id`. Long prompts are truncated to `max_len` tokens, keeping
/// `eos_id` as the final token.
pub(crate) fn pad_tokens(
    mut tokens: Vec<u32>,
    max_len: usize,
    pad_id: u32,
    eos_id: u32,
) -> Vec<u32> {
    if tokens.len() > max_len {
        warn!(
            "prompt is {} tokens long, truncating to the text encoder limit of {max_len}",
            tokens.len()
        );
        tokens.truncate(max_len.saturating_sub(1));
        tokens.push(eos_id);
    }
    tokens.resize(max_len, pad_id);
    tokens
}

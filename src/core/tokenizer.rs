//! Token counting for prompt-size routing and usage estimation.
//!
//! Two tiktoken encodings are supported: `o200k_base` for the gpt-4o, gpt-4.1,
//! gpt-5 and o-series families and `cl100k_base` for everything else.

use once_cell::sync::Lazy;
use serde_json::Value;
use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Tokenizer encoding selected for a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Cl100kBase,
    O200kBase,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Cl100kBase => "cl100k_base",
            Encoding::O200kBase => "o200k_base",
        }
    }
}

static CL100K: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!("Failed to load cl100k_base encoding: {}", e);
        None
    }
});

static O200K: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::o200k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!("Failed to load o200k_base encoding: {}", e);
        None
    }
});

/// Select the encoding for a model family name such as `gpt-4o` or `gpt-35-turbo`.
pub fn encoding_for_family(family: &str) -> Encoding {
    let family = family.trim().to_lowercase();
    let o200k_prefixes = ["gpt-4o", "gpt-4.1", "gpt-5", "o1", "o3", "o4", "chatgpt-4o"];
    if o200k_prefixes.iter().any(|p| family.starts_with(p)) {
        Encoding::O200kBase
    } else {
        Encoding::Cl100kBase
    }
}

/// Count tokens in `text`.
///
/// Falls back to a four-characters-per-token estimate when the encoding cannot be loaded.
pub fn count_tokens(text: &str, encoding: Encoding) -> usize {
    let bpe = match encoding {
        Encoding::Cl100kBase => CL100K.as_ref(),
        Encoding::O200kBase => O200K.as_ref().or(CL100K.as_ref()),
    };
    match bpe {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Concatenate the text of every message in a chat completion request.
///
/// Message content may be a plain string or an array of typed parts.
pub fn prompt_text(body: &Value) -> String {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return String::new();
    };

    let mut text = String::new();
    for message in messages {
        if let Some(content) = message.get("content") {
            append_content(&mut text, content);
        }
    }
    text
}

/// Append the textual parts of a message `content` value.
pub(crate) fn append_content(out: &mut String, content: &Value) {
    match content {
        Value::String(s) => {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(s);
        }
        Value::Array(parts) => {
            for part in parts {
                if let Some(s) = part.get("text").and_then(Value::as_str) {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(s);
                }
            }
        }
        _ => {}
    }
}

/// Count prompt tokens of a chat completion request.
pub fn count_prompt_tokens(body: &Value, encoding: Encoding) -> usize {
    count_tokens(&prompt_text(body), encoding)
}

// Answer generation module
// Prompt assembly over retrieved context, conversation memory, and
// structured (JSON) output parsing


use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::index::RetrievalResult;
use crate::{RagError, Result};

const INSTRUCTION: &str = "You are a helpful assistant that answers questions about the user's documents. \
Answer using only the context passages below. \
If the context does not contain the answer, say that you don't know.";

const FALLBACK_INSTRUCTION: &str = "You are a helpful assistant. \
No indexed document matched this question, so answer from general knowledge \
and mention that no supporting documents were found.";

const STRUCTURED_INSTRUCTION: &str = "Respond with JSON only, without any explanation or Markdown.";

/// Returned in place of an empty completion
pub const EMPTY_ANSWER_NOTICE: &str =
    "The model returned an empty answer. Try rephrasing the question.";

/// Produces a completion for a prompt.
///
/// Implementations are blocking, like [`Embedder`](crate::embeddings::Embedder).
pub trait Generator: Send + Sync {
    fn generation_model(&self) -> &str;

    fn generate(&self, prompt: &str) -> Result<String>;
}

/// One question and the answer given to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

/// The most recent turns of a conversation, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatHistory {
    turns: VecDeque<Turn>,
    capacity: usize,
}

impl ChatHistory {
    /// A history keeping at most `capacity` turns. Zero disables memory.
    #[inline]
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn push(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(Turn {
            question: question.into(),
            answer: answer.into(),
        });
    }

    #[inline]
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

/// A generated answer together with the context it was conditioned on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub context: RetrievalResult,
}

/// Turns a question plus retrieved chunks into a single model call
#[derive(Clone)]
pub struct AnswerGenerator {
    generator: Arc<dyn Generator>,
}

impl std::fmt::Debug for AnswerGenerator {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerGenerator")
            .field("model", &self.generator.generation_model())
            .finish()
    }
}

impl AnswerGenerator {
    #[inline]
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    #[inline]
    pub fn generation_model(&self) -> &str {
        self.generator.generation_model()
    }

    /// Answer `question` from `context`. An empty context falls back to a
    /// general-knowledge prompt rather than failing.
    #[inline]
    pub fn answer(
        &self,
        question: &str,
        context: RetrievalResult,
        history: &ChatHistory,
    ) -> Result<Answer> {
        let prompt = build_prompt(question, &context, history);
        debug!(
            "Generating answer with {} context chunks and {} history turns",
            context.len(),
            history.len()
        );

        let text = self.generator.generate(&prompt)?;
        let text = if text.trim().is_empty() {
            warn!("Model returned an empty answer");
            EMPTY_ANSWER_NOTICE.to_string()
        } else {
            text
        };

        Ok(Answer { text, context })
    }

    /// Ask for a JSON answer shaped as described by `format` and parse it
    /// with [`parse_json_list`]
    #[inline]
    pub fn answer_structured<T: DeserializeOwned>(
        &self,
        question: &str,
        context: &RetrievalResult,
        format: &str,
    ) -> Result<Vec<T>> {
        let mut prompt = build_prompt(question, context, &ChatHistory::default());
        let _ = write!(
            prompt,
            "\n\n{}\nThe JSON must match this format:\n{}\n",
            STRUCTURED_INSTRUCTION, format
        );

        let raw = self.generator.generate(&prompt)?;
        parse_json_list(&raw)
    }
}

/// Assemble the prompt: instruction, ranked context blocks, recent turns, question
#[inline]
pub fn build_prompt(question: &str, context: &RetrievalResult, history: &ChatHistory) -> String {
    let mut prompt = String::new();

    if context.is_empty() {
        prompt.push_str(FALLBACK_INSTRUCTION);
        prompt.push_str("\n\n");
    } else {
        prompt.push_str(INSTRUCTION);
        prompt.push_str("\n\nContext:\n");
        for (rank, hit) in context.iter().enumerate() {
            let _ = write!(
                prompt,
                "[{}] {} (chunk {})\n<<<\n{}\n>>>\n",
                rank + 1,
                hit.chunk.document_id,
                hit.chunk.chunk_index,
                hit.chunk.text
            );
        }
        prompt.push('\n');
    }

    if !history.is_empty() {
        prompt.push_str("Conversation so far:\n");
        for turn in history.turns() {
            let _ = writeln!(prompt, "User: {}", turn.question);
            let _ = writeln!(prompt, "Assistant: {}", turn.answer);
        }
        prompt.push('\n');
    }

    let _ = write!(prompt, "Question: {}\nAnswer:", question);
    prompt
}

/// Parse a model response into a list of `T`.
///
/// Markdown code fences and any prose around the JSON are ignored. A single
/// object is accepted as a one-element list. Each `[` or `{` is tried in turn,
/// so brackets in leading prose do not hide the JSON that follows.
#[inline]
pub fn parse_json_list<T: DeserializeOwned>(raw: &str) -> Result<Vec<T>> {
    let body = strip_code_fence(raw);
    let mut failure: Option<String> = None;

    for (start, _) in body.match_indices(['[', '{']) {
        let Some(candidate) = body.get(start..) else {
            continue;
        };
        let Some(parsed) = serde_json::Deserializer::from_str(candidate)
            .into_iter::<serde_json::Value>()
            .next()
        else {
            continue;
        };

        match parsed.map_err(|e| e.to_string()).and_then(list_from_value::<T>) {
            Ok(items) => return Ok(items),
            Err(message) => {
                failure.get_or_insert(message);
            }
        }
    }

    Err(RagError::Parse {
        message: failure.unwrap_or_else(|| "no JSON object or array in response".to_string()),
        raw: raw.to_string(),
    })
}

fn list_from_value<T: DeserializeOwned>(value: serde_json::Value) -> std::result::Result<Vec<T>, String> {
    match value {
        serde_json::Value::Array(_) => serde_json::from_value(value).map_err(|e| e.to_string()),
        serde_json::Value::Object(_) => serde_json::from_value(value)
            .map(|item| vec![item])
            .map_err(|e| e.to_string()),
        _ => Err("expected a JSON object or array".to_string()),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some((_, after)) = text.split_once("```") else {
        return text;
    };

    // Skip a language tag such as ```json
    let body = match after.split_once('\n') {
        Some((tag, rest)) if tag.trim().chars().all(|c| c.is_ascii_alphanumeric()) => rest,
        _ => after,
    };

    body.split_once("```").map_or(body, |(inside, _)| inside)
}

//! LLM-backed conversation summarization and incremental memory compression.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::context::Message;
use crate::error::Result;

/// A minimal LLM text-completion seam: given a prompt, return generated text.
/// Kept separate from any concrete provider so the compressor can be tested
/// without a real model behind it.
#[async_trait]
pub trait SummarizerLlm: Send + Sync {
    /// Generate text for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// An `LlmFn` adapter for plain async closures, mirroring the reference
/// implementation's `llm_func` callback parameter.
pub struct LlmFn<F>(pub F);

#[async_trait]
impl<F, Fut> SummarizerLlm for LlmFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<String>> + Send,
{
    async fn generate(&self, prompt: &str) -> Result<String> {
        (self.0)(prompt.to_string()).await
    }
}

/// Compression aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionLevel {
    /// Keep most detail (~500 words).
    Minimal,
    /// Balanced compression (~250 words).
    Moderate,
    /// Maximum compression (~100 words).
    Aggressive,
}

impl CompressionLevel {
    fn max_words(self) -> u32 {
        match self {
            CompressionLevel::Minimal => 500,
            CompressionLevel::Moderate => 250,
            CompressionLevel::Aggressive => 100,
        }
    }
}

/// Result of a single compression operation.
#[derive(Debug, Clone)]
pub struct CompressionResult {
    /// Token count of the original conversation text.
    pub original_tokens: usize,
    /// Token count of the summary plus key points.
    pub compressed_tokens: usize,
    /// `compressed_tokens / original_tokens`, 0 when there was nothing to compress.
    pub compression_ratio: f64,
    /// Generated summary.
    pub summary: String,
    /// Extracted key points, if enabled.
    pub key_points: Vec<String>,
    /// Number of messages that went into this result.
    pub message_count: usize,
}

/// Memory compressor configuration.
#[derive(Debug, Clone)]
pub struct CompressorConfig {
    /// Default aggressiveness when a call doesn't override it.
    pub level: CompressionLevel,
    /// Whether to run a second LLM call extracting bullet key points.
    pub include_key_points: bool,
    /// Cap on the number of key points returned.
    pub max_key_points: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            level: CompressionLevel::Moderate,
            include_key_points: true,
            max_key_points: 10,
        }
    }
}

const SUMMARY_PROMPT: &str = "Summarize the following conversation concisely while preserving key information:\n\nConversation:\n{conversation}\n\nProvide a summary that captures:\n1. Main topics discussed\n2. Key decisions or conclusions\n3. Important facts mentioned\n4. Any action items or next steps\n\nSummary:";

const KEY_POINTS_PROMPT: &str = "Extract the key points from this conversation:\n\n{conversation}\n\nList up to {max_points} key points, each on a new line starting with \"- \":";

const HIERARCHICAL_PROMPT: &str = "You have these summaries of previous conversation segments:\n\n{summaries}\n\nCreate a unified summary that combines these while removing redundancy:";

fn format_conversation(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.content).to_uppercase())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn cache_key(messages: &[Message]) -> String {
    let mut hasher = Sha256::new();
    for msg in messages {
        hasher.update(format!("{:?}", msg.role));
        hasher.update(msg.content.chars().take(100).collect::<String>());
    }
    format!("{:x}", hasher.finalize())
}

/// Summarizes conversation history via an LLM, with a content-hash result cache.
pub struct MemoryCompressor {
    llm: Arc<dyn SummarizerLlm>,
    config: CompressorConfig,
    token_counter: Box<dyn Fn(&str) -> usize + Send + Sync>,
    cache: Mutex<HashMap<String, CompressionResult>>,
}

impl MemoryCompressor {
    /// Build a compressor from an LLM backend and config, using the default
    /// character-based token approximation.
    pub fn new(llm: Arc<dyn SummarizerLlm>, config: CompressorConfig) -> Self {
        Self {
            llm,
            config,
            token_counter: Box::new(|text| text.chars().count() / 4),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Override the token counting function.
    pub fn with_token_counter(mut self, counter: Box<dyn Fn(&str) -> usize + Send + Sync>) -> Self {
        self.token_counter = counter;
        self
    }

    /// Summarize `messages`, optionally overriding the configured level.
    /// Results are cached by a hash of (role, first 100 chars) per message.
    pub async fn compress(&self, messages: &[Message], level: Option<CompressionLevel>) -> Result<CompressionResult> {
        let level = level.unwrap_or(self.config.level);
        let key = cache_key(messages);

        if let Some(cached) = self.cache.lock().get(&key).cloned() {
            return Ok(cached);
        }

        let conversation = format_conversation(messages);
        let original_tokens = (self.token_counter)(&conversation);

        let summary = self.generate_summary(&conversation, level).await?;

        let key_points = if self.config.include_key_points {
            self.extract_key_points(&conversation).await?
        } else {
            Vec::new()
        };

        let compressed_text = format!("{summary}\n{}", key_points.join("\n"));
        let compressed_tokens = (self.token_counter)(&compressed_text);

        let result = CompressionResult {
            original_tokens,
            compressed_tokens,
            compression_ratio: if original_tokens > 0 {
                compressed_tokens as f64 / original_tokens as f64
            } else {
                0.0
            },
            summary,
            key_points,
            message_count: messages.len(),
        };

        self.cache.lock().insert(key, result.clone());
        Ok(result)
    }

    /// Summarize each chunk independently, then combine the per-chunk
    /// summaries into one unified summary. Suited to conversations too long
    /// to summarize in a single call.
    pub async fn compress_hierarchical(&self, chunks: &[Vec<Message>]) -> Result<CompressionResult> {
        let mut chunk_summaries = Vec::with_capacity(chunks.len());
        let mut total_original = 0usize;

        for chunk in chunks {
            let result = self.compress(chunk, None).await?;
            chunk_summaries.push(result.summary);
            total_original += result.original_tokens;
        }

        let unified_summary = if chunk_summaries.len() > 1 {
            let combined = chunk_summaries.join("\n\n---\n\n");
            self.generate_unified_summary(&combined).await?
        } else {
            chunk_summaries.into_iter().next().unwrap_or_default()
        };

        let compressed_tokens = (self.token_counter)(&unified_summary);

        Ok(CompressionResult {
            original_tokens: total_original,
            compressed_tokens,
            compression_ratio: if total_original > 0 {
                compressed_tokens as f64 / total_original as f64
            } else {
                0.0
            },
            summary: unified_summary,
            key_points: Vec::new(),
            message_count: chunks.iter().map(Vec::len).sum(),
        })
    }

    async fn generate_summary(&self, conversation: &str, level: CompressionLevel) -> Result<String> {
        let prompt = format!(
            "{}\n\nKeep the summary under {} words.",
            SUMMARY_PROMPT.replace("{conversation}", conversation),
            level.max_words()
        );
        self.llm.generate(&prompt).await
    }

    async fn extract_key_points(&self, conversation: &str) -> Result<Vec<String>> {
        let prompt = KEY_POINTS_PROMPT
            .replace("{conversation}", conversation)
            .replace("{max_points}", &self.config.max_key_points.to_string());

        let response = self.llm.generate(&prompt).await?;

        let mut points = Vec::new();
        for line in response.lines() {
            let line = line.trim();
            if let Some(point) = line.strip_prefix("- ") {
                points.push(point.to_string());
            } else if !line.is_empty() && points.len() < self.config.max_key_points {
                points.push(line.to_string());
            }
        }
        points.truncate(self.config.max_key_points);
        Ok(points)
    }

    async fn generate_unified_summary(&self, summaries: &str) -> Result<String> {
        let prompt = HIERARCHICAL_PROMPT.replace("{summaries}", summaries);
        self.llm.generate(&prompt).await
    }

    /// Drop all cached compression results.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

/// Incrementally compresses conversation history as it grows, maintaining a
/// running summary updated once `compression_threshold` messages accumulate.
///
/// Compression runs as an explicit, awaited step rather than a
/// fire-and-forget background task: there's no ambient "current task" to
/// spawn onto without a handle, and spawning one unconditionally would
/// silently race `get_context` against an in-flight compression. Callers
/// await [`compress_if_due`](Self::compress_if_due) explicitly after adding a
/// message, which keeps the state machine exact instead of eventually-consistent.
pub struct IncrementalCompressor {
    compressor: MemoryCompressor,
    threshold: usize,
    max_recent: usize,
    messages: Mutex<Vec<Message>>,
    summary: Mutex<String>,
}

impl IncrementalCompressor {
    /// Build an incremental compressor over `llm`, compressing once
    /// `compression_threshold` messages accumulate and keeping the most
    /// recent `max_recent_messages` uncompressed.
    pub fn new(llm: Arc<dyn SummarizerLlm>, compression_threshold: usize, max_recent_messages: usize) -> Self {
        Self {
            compressor: MemoryCompressor::new(llm, CompressorConfig::default()),
            threshold: compression_threshold,
            max_recent: max_recent_messages,
            messages: Mutex::new(Vec::new()),
            summary: Mutex::new(String::new()),
        }
    }

    /// Append a message. Call [`compress_if_due`](Self::compress_if_due)
    /// afterward to run compression once the threshold is crossed.
    pub fn add_message(&self, message: Message) {
        self.messages.lock().push(message);
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// True when no messages are buffered.
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// If the buffered message count has reached the threshold, compress the
    /// older messages into the running summary and trim the buffer to the
    /// most recent `max_recent_messages`. No-op otherwise.
    pub async fn compress_if_due(&self) -> Result<()> {
        let should_compress = self.messages.lock().len() >= self.threshold;
        if !should_compress {
            return Ok(());
        }
        self.compress().await
    }

    async fn compress(&self) -> Result<()> {
        let mut to_compress: Vec<Message> = {
            let mut messages = self.messages.lock();
            if messages.len() <= self.max_recent {
                return Ok(());
            }
            let split = messages.len() - self.max_recent;
            messages.drain(0..split).collect()
        };

        let existing_summary = self.summary.lock().clone();
        if !existing_summary.is_empty() {
            to_compress.insert(
                0,
                Message::new(crate::context::MessageRole::System, format!("Previous summary: {existing_summary}")),
            );
        }

        let result = self.compressor.compress(&to_compress, None).await?;
        *self.summary.lock() = result.summary;
        Ok(())
    }

    /// Context ready for an API call: the running summary (if any) as a
    /// system note, followed by the uncompressed recent messages.
    pub fn context(&self) -> Vec<Message> {
        let summary = self.summary.lock().clone();
        let mut context = Vec::new();
        if !summary.is_empty() {
            context.push(Message::new(
                crate::context::MessageRole::System,
                format!("Conversation summary so far:\n{summary}"),
            ));
        }
        context.extend(self.messages.lock().iter().cloned());
        context
    }

    /// Current running summary, empty if none has been generated yet.
    pub fn summary(&self) -> String {
        self.summary.lock().clone()
    }

    /// Clear all buffered messages and the running summary.
    pub fn clear(&self) {
        self.messages.lock().clear();
        self.summary.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MessageRole;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubLlm {
        calls: AtomicUsize,
        response: String,
    }

    impl StubLlm {
        fn new(response: impl Into<String>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: response.into(),
            }
        }
    }

    #[async_trait]
    impl SummarizerLlm for StubLlm {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn messages(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message::new(MessageRole::User, format!("message {i}")))
            .collect()
    }

    #[tokio::test]
    async fn test_compress_returns_summary_and_key_points() {
        let llm = Arc::new(StubLlm::new("- point one\n- point two\nSummary text"));
        let compressor = MemoryCompressor::new(llm, CompressorConfig::default());

        let result = compressor.compress(&messages(5), None).await.unwrap();
        assert!(!result.summary.is_empty());
        assert_eq!(result.message_count, 5);
    }

    #[tokio::test]
    async fn test_compress_caches_identical_input() {
        let llm = Arc::new(StubLlm::new("same summary"));
        let compressor = MemoryCompressor::new(llm.clone(), CompressorConfig::default());

        let msgs = messages(3);
        compressor.compress(&msgs, None).await.unwrap();
        compressor.compress(&msgs, None).await.unwrap();

        // Two LLM calls per compress (summary + key points); a cache hit on
        // the second compress means the call count stops growing.
        let calls_after_one = llm.calls.load(Ordering::SeqCst);
        compressor.compress(&msgs, None).await.unwrap();
        assert_eq!(llm.calls.load(Ordering::SeqCst), calls_after_one);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_recompute() {
        let llm = Arc::new(StubLlm::new("summary"));
        let compressor = MemoryCompressor::new(llm.clone(), CompressorConfig::default());

        let msgs = messages(2);
        compressor.compress(&msgs, None).await.unwrap();
        let calls_before = llm.calls.load(Ordering::SeqCst);
        compressor.clear_cache();
        compressor.compress(&msgs, None).await.unwrap();
        assert!(llm.calls.load(Ordering::SeqCst) > calls_before);
    }

    #[tokio::test]
    async fn test_compress_hierarchical_combines_chunk_summaries() {
        let llm = Arc::new(StubLlm::new("chunk summary"));
        let compressor = MemoryCompressor::new(llm, CompressorConfig::default());

        let chunks = vec![messages(3), messages(3)];
        let result = compressor.compress_hierarchical(&chunks).await.unwrap();
        assert_eq!(result.message_count, 6);
        assert!(!result.summary.is_empty());
    }

    #[tokio::test]
    async fn test_incremental_compressor_compresses_once_threshold_crossed() {
        let llm = Arc::new(StubLlm::new("running summary"));
        let compressor = IncrementalCompressor::new(llm, 5, 2);

        for i in 0..5 {
            compressor.add_message(Message::new(MessageRole::User, format!("m{i}")));
        }
        compressor.compress_if_due().await.unwrap();

        assert_eq!(compressor.len(), 2);
        assert!(!compressor.summary().is_empty());
    }

    #[tokio::test]
    async fn test_incremental_compressor_noop_below_threshold() {
        let llm = Arc::new(StubLlm::new("summary"));
        let compressor = IncrementalCompressor::new(llm, 10, 2);

        compressor.add_message(Message::new(MessageRole::User, "hello"));
        compressor.compress_if_due().await.unwrap();

        assert_eq!(compressor.len(), 1);
        assert!(compressor.summary().is_empty());
    }

    #[tokio::test]
    async fn test_incremental_compressor_context_includes_summary_then_recent() {
        let llm = Arc::new(StubLlm::new("older stuff happened"));
        let compressor = IncrementalCompressor::new(llm, 3, 1);

        for i in 0..3 {
            compressor.add_message(Message::new(MessageRole::User, format!("m{i}")));
        }
        compressor.compress_if_due().await.unwrap();

        let context = compressor.context();
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].role, MessageRole::System);
    }
}

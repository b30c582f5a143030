//! Context window management: keeps a conversation under a model's token
//! budget by truncating, windowing, prioritizing, or summarizing history.

use std::collections::HashMap;

/// Role of a message within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    /// System/instruction message.
    System,
    /// End-user message.
    User,
    /// Model-generated message.
    Assistant,
    /// Tool execution result.
    Tool,
    /// Legacy function-call result.
    Function,
}

/// A single conversation message with retention metadata.
#[derive(Debug, Clone)]
pub struct Message {
    /// Who sent the message.
    pub role: MessageRole,
    /// Message body.
    pub content: String,
    /// Optional name (tool/function identity).
    pub name: Option<String>,
    /// Optional tool-call correlation id.
    pub tool_call_id: Option<String>,
    /// Higher values are kept longer under the `Priority` strategy.
    pub priority: i32,
    /// Cached token count, filled in by [`ContextWindowManager::add_message`].
    pub token_count: Option<usize>,
    /// Free-form metadata, not interpreted by this module.
    pub metadata: HashMap<String, String>,
}

impl Message {
    /// Build a message with default priority 0 and no metadata.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            priority: 0,
            token_count: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the retention priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// API-compatible representation: role and content, plus name/tool_call_id
    /// when present.
    pub fn to_api_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("role", format!("{:?}", self.role).to_lowercase()),
            ("content", self.content.clone()),
        ];
        if let Some(name) = &self.name {
            fields.push(("name", name.clone()));
        }
        if let Some(id) = &self.tool_call_id {
            fields.push(("tool_call_id", id.clone()));
        }
        fields
    }
}

/// How to shrink history once it exceeds the target token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationStrategy {
    /// Drop oldest low-priority messages first.
    Fifo,
    /// Drop newest messages first, preserving the latest user message.
    Lifo,
    /// Keep only the most recent N messages.
    SlidingWindow,
    /// Drop lowest-priority messages first, regardless of age.
    Priority,
    /// Summarize older messages into a single system note instead of dropping them.
    Summarize,
}

/// Context manager configuration.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Model's total context window, in tokens.
    pub max_tokens: usize,
    /// Target token count to stay under once history grows.
    pub target_tokens: usize,
    /// Tokens reserved for the model's response.
    pub reserve_tokens: usize,
    /// Truncation strategy applied once `target_tokens` is exceeded.
    pub truncation_strategy: TruncationStrategy,
    /// Messages to keep under `SlidingWindow` (and as the floor for others).
    pub sliding_window_size: usize,
    /// Minimum messages retained regardless of strategy.
    pub min_messages: usize,
    /// Always keep the latest user message under `Lifo`.
    pub preserve_latest_user: bool,
    /// Never drop the pinned system message, regardless of truncation
    /// strategy. The system message already lives outside the truncatable
    /// history list and every strategy retains it unconditionally, so this
    /// is the documented default rather than a switch any strategy branches
    /// on today.
    pub preserve_system: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 128_000,
            target_tokens: 100_000,
            reserve_tokens: 4_000,
            truncation_strategy: TruncationStrategy::SlidingWindow,
            sliding_window_size: 50,
            min_messages: 4,
            preserve_latest_user: true,
            preserve_system: true,
        }
    }
}

/// Counts tokens for a single piece of text or a full message list.
pub trait TokenCounter: Send + Sync {
    /// Count tokens in a raw string.
    fn count(&self, text: &str) -> usize;

    /// Count tokens across a message list, including per-message overhead.
    fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count(&m.content) + 4).sum::<usize>() + 2
    }
}

/// Character-based token estimate (~4 characters per token). Fast, model-agnostic,
/// and the right default when an exact tokenizer isn't worth the dependency.
#[derive(Debug, Clone, Copy)]
pub struct ApproximateTokenCounter {
    /// Average characters per token.
    pub chars_per_token: f64,
}

impl Default for ApproximateTokenCounter {
    fn default() -> Self {
        Self { chars_per_token: 4.0 }
    }
}

impl TokenCounter for ApproximateTokenCounter {
    fn count(&self, text: &str) -> usize {
        (text.chars().count() as f64 / self.chars_per_token) as usize
    }

    fn count_messages(&self, messages: &[Message]) -> usize {
        let mut total = 0usize;
        for msg in messages {
            total += 4;
            total += self.count(&msg.content);
            if let Some(name) = &msg.name {
                total += self.count(name) + 1;
            }
        }
        total
    }
}

/// Counts tokens via a caller-supplied tokenizer callback (e.g. a
/// `tiktoken`/BPE binding). Falls back to an approximate count if no
/// callback is configured, matching the graceful degradation of the
/// reference tokenizer-backed counter.
pub struct CallbackTokenCounter {
    encode: Option<Box<dyn Fn(&str) -> usize + Send + Sync>>,
    fallback: ApproximateTokenCounter,
}

impl CallbackTokenCounter {
    /// Build a counter that defers to `encode` for exact counts.
    pub fn new(encode: impl Fn(&str) -> usize + Send + Sync + 'static) -> Self {
        Self {
            encode: Some(Box::new(encode)),
            fallback: ApproximateTokenCounter::default(),
        }
    }

    /// Build a counter with no callback configured; behaves exactly like
    /// [`ApproximateTokenCounter`] until one is attached.
    pub fn unconfigured() -> Self {
        Self {
            encode: None,
            fallback: ApproximateTokenCounter::default(),
        }
    }
}

impl TokenCounter for CallbackTokenCounter {
    fn count(&self, text: &str) -> usize {
        match &self.encode {
            Some(encode) => encode(text),
            None => self.fallback.count(text),
        }
    }

    fn count_messages(&self, messages: &[Message]) -> usize {
        if self.encode.is_none() {
            return self.fallback.count_messages(messages);
        }
        let mut total = 0usize;
        for msg in messages {
            total += 4;
            total += self.count(&msg.content);
            if let Some(name) = &msg.name {
                total += self.count(name) + 1;
            }
        }
        total + 2
    }
}

/// Summary line-item stats for [`ContextWindowManager::stats`].
#[derive(Debug, Clone)]
pub struct ContextStats {
    /// Total retained messages, including system and summary notes.
    pub total_messages: usize,
    /// Count of user-role messages.
    pub user_messages: usize,
    /// Count of assistant-role messages.
    pub assistant_messages: usize,
    /// Current token usage.
    pub current_tokens: usize,
    /// Tokens still available before `target_tokens` is hit.
    pub available_tokens: i64,
    /// Configured max tokens.
    pub max_tokens: usize,
    /// Configured target tokens.
    pub target_tokens: usize,
    /// `current_tokens / max_tokens`.
    pub utilization: f64,
    /// Whether a summary note is currently attached.
    pub has_summary: bool,
}

/// Manages a conversation's message history under a token budget.
pub struct ContextWindowManager {
    config: ContextConfig,
    counter: Box<dyn TokenCounter>,
    summarizer: Option<Box<dyn Fn(&[Message]) -> String + Send + Sync>>,
    messages: Vec<Message>,
    system_message: Option<Message>,
    summary: Option<String>,
}

impl ContextWindowManager {
    /// Build a manager with the given config and an approximate token counter.
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            counter: Box::new(ApproximateTokenCounter::default()),
            summarizer: None,
            messages: Vec::new(),
            system_message: None,
            summary: None,
        }
    }

    /// Use a custom token counter instead of the character approximation.
    pub fn with_token_counter(mut self, counter: Box<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    /// Attach a summarizer callback, used by the `Summarize` strategy. Without
    /// one, `Summarize` falls back to `SlidingWindow`, matching the reference
    /// behavior exactly.
    pub fn with_summarizer(mut self, summarizer: Box<dyn Fn(&[Message]) -> String + Send + Sync>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Set (or replace) the system message.
    pub fn set_system_message(&mut self, content: impl Into<String>, priority: i32) {
        self.system_message = Some(Message::new(MessageRole::System, content).with_priority(priority));
    }

    fn all_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 2);
        if let Some(system) = &self.system_message {
            out.push(system.clone());
        }
        if let Some(summary) = &self.summary {
            out.push(
                Message::new(
                    MessageRole::System,
                    format!("Previous conversation summary:\n{summary}"),
                )
                .with_priority(5),
            );
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    /// Current total token usage across system message, summary, and history.
    pub fn current_tokens(&self) -> usize {
        self.counter.count_messages(&self.all_messages())
    }

    /// Tokens still available before hitting `target_tokens`, net of the
    /// response reserve. May be negative if already over budget.
    pub fn available_tokens(&self) -> i64 {
        self.config.target_tokens as i64 - self.current_tokens() as i64 - self.config.reserve_tokens as i64
    }

    /// Total retained message count, including the system message.
    pub fn message_count(&self) -> usize {
        self.messages.len() + if self.system_message.is_some() { 1 } else { 0 }
    }

    /// Add a message to history, truncating if this pushes token usage over
    /// `target_tokens`. Returns `false` when truncation occurred.
    pub fn add_message(&mut self, mut message: Message) -> bool {
        message.token_count = Some(self.counter.count(&message.content));
        self.messages.push(message);

        if self.current_tokens() > self.config.target_tokens {
            self.truncate();
            false
        } else {
            true
        }
    }

    /// Add several messages in order.
    pub fn add_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.add_message(message);
        }
    }

    fn truncate(&mut self) {
        match self.config.truncation_strategy {
            TruncationStrategy::Fifo => self.truncate_fifo(),
            TruncationStrategy::Lifo => self.truncate_lifo(),
            TruncationStrategy::SlidingWindow => self.truncate_sliding_window(),
            TruncationStrategy::Priority => self.truncate_priority(),
            TruncationStrategy::Summarize => self.truncate_summarize(),
        }
    }

    /// Drop low-priority messages oldest-first; once every remaining message
    /// is high-priority, drop the oldest regardless. The high-priority check
    /// is bounded to one pass over the current list per iteration, so this
    /// always terminates at `min_messages` even when every message is
    /// high-priority from the start.
    fn truncate_fifo(&mut self) {
        while self.current_tokens() > self.config.target_tokens && self.messages.len() > self.config.min_messages {
            let low_priority_idx = self.messages.iter().position(|m| m.priority < 5);
            match low_priority_idx {
                Some(idx) => {
                    self.messages.remove(idx);
                }
                None => {
                    self.messages.remove(0);
                }
            }
        }
    }

    fn truncate_lifo(&mut self) {
        while self.current_tokens() > self.config.target_tokens && self.messages.len() > self.config.min_messages {
            if self.config.preserve_latest_user {
                let latest_user_idx = self.messages.iter().rposition(|m| m.role == MessageRole::User);
                let remove_idx = self
                    .messages
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(i, _)| Some(*i) != latest_user_idx)
                    .map(|(i, _)| i);
                match remove_idx {
                    Some(idx) => {
                        self.messages.remove(idx);
                    }
                    None => break,
                }
            } else {
                self.messages.pop();
            }
        }
    }

    fn truncate_sliding_window(&mut self) {
        let window = self.config.sliding_window_size;
        if self.messages.len() > window {
            let start = self.messages.len() - window;
            self.messages.drain(0..start);
        }
    }

    fn truncate_priority(&mut self) {
        while self.current_tokens() > self.config.target_tokens && self.messages.len() > self.config.min_messages {
            let min_idx = self
                .messages
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| m.priority)
                .map(|(i, _)| i);
            match min_idx {
                Some(idx) => {
                    self.messages.remove(idx);
                }
                None => break,
            }
        }
    }

    fn truncate_summarize(&mut self) {
        let Some(summarizer) = &self.summarizer else {
            self.truncate_sliding_window();
            return;
        };

        let keep = self.config.min_messages;
        if self.messages.len() > keep {
            let split = self.messages.len() - keep;
            let to_summarize: Vec<Message> = self.messages.drain(0..split).collect();
            self.summary = Some(summarizer(&to_summarize));
        }
    }

    /// API-ready message fields: system message, summary note (if any), then history.
    pub fn context(&self) -> Vec<Vec<(&'static str, String)>> {
        self.all_messages().iter().map(Message::to_api_fields).collect()
    }

    /// All retained messages, including the system message and summary note.
    pub fn messages(&self) -> Vec<Message> {
        self.all_messages()
    }

    /// Clear conversation history. When `keep_system` is false, also drops
    /// the system message.
    pub fn clear(&mut self, keep_system: bool) {
        self.messages.clear();
        self.summary = None;
        if !keep_system {
            self.system_message = None;
        }
    }

    /// Snapshot of usage statistics.
    pub fn stats(&self) -> ContextStats {
        let messages = self.all_messages();
        let current_tokens = self.counter.count_messages(&messages);
        ContextStats {
            total_messages: messages.len(),
            user_messages: messages.iter().filter(|m| m.role == MessageRole::User).count(),
            assistant_messages: messages.iter().filter(|m| m.role == MessageRole::Assistant).count(),
            current_tokens,
            available_tokens: self.available_tokens(),
            max_tokens: self.config.max_tokens,
            target_tokens: self.config.target_tokens,
            utilization: current_tokens as f64 / self.config.max_tokens as f64,
            has_summary: self.summary.is_some(),
        }
    }
}

/// Per-model context window sizes, used by [`context_manager_for_model`].
pub fn model_context_limit(model: &str) -> usize {
    match model {
        "gemini-1.5-pro" | "gemini-1.5-flash" => 1_000_000,
        "gemini-1.0-pro" => 30_720,
        "gpt-4-turbo" => 128_000,
        "gpt-4" => 8_192,
        "gpt-3.5-turbo" => 16_385,
        "claude-3-opus" | "claude-3-sonnet" => 200_000,
        _ => 128_000,
    }
}

/// Build a manager sized for `model`, targeting 80% of its context window.
pub fn context_manager_for_model(model: &str, strategy: TruncationStrategy) -> ContextWindowManager {
    let max_tokens = model_context_limit(model);
    let target_tokens = (max_tokens as f64 * 0.8) as usize;
    ContextWindowManager::new(ContextConfig {
        max_tokens,
        target_tokens,
        truncation_strategy: strategy,
        ..ContextConfig::default()
    })
}

//! Length, encoding, and injection-pattern validation for untrusted text
//! headed into an AI request pipeline, plus optional PII masking.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::Result;

/// How strictly detected threats block the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// Only the most severe threats (XSS, SQL injection) block.
    Permissive,
    /// XSS, SQL injection, and path traversal block.
    Standard,
    /// Any detected threat blocks.
    Strict,
}

/// Category of threat a validator pattern can flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    Xss,
    SqlInjection,
    CommandInjection,
    PathTraversal,
    ExcessiveLength,
    InvalidCharacters,
}

/// Outcome of validating and sanitizing one piece of text.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub sanitized_text: String,
    pub threats_detected: Vec<ThreatType>,
    pub warnings: Vec<String>,
    pub original_length: usize,
    pub sanitized_length: usize,
}

/// Tunable knobs for [`InputValidator`].
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub max_length: usize,
    pub min_length: usize,
    pub max_line_count: usize,
    pub strip_html: bool,
    pub normalize_unicode: bool,
    pub normalize_whitespace: bool,
    pub block_control_characters: bool,
    pub level: ValidationLevel,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_length: 32_000,
            min_length: 1,
            max_line_count: 1_000,
            strip_html: true,
            normalize_unicode: true,
            normalize_whitespace: true,
            block_control_characters: true,
            level: ValidationLevel::Standard,
        }
    }
}

struct PatternSet {
    xss: Vec<Regex>,
    sql_injection: Vec<Regex>,
    command_injection: Vec<Regex>,
    path_traversal: Vec<Regex>,
    control_chars: Regex,
    html_tag: Regex,
}

static PATTERNS: LazyLock<PatternSet> = LazyLock::new(|| PatternSet {
    xss: vec![
        Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap(),
        Regex::new(r"(?i)javascript:").unwrap(),
        Regex::new(r"(?i)on\w+\s*=").unwrap(),
        Regex::new(r"(?i)<iframe[^>]*>").unwrap(),
        Regex::new(r"(?i)<object[^>]*>").unwrap(),
        Regex::new(r"(?i)<embed[^>]*>").unwrap(),
        Regex::new(r"(?i)<link[^>]*>").unwrap(),
        Regex::new(r"(?i)<meta[^>]*>").unwrap(),
        Regex::new(r"(?i)expression\s*\(").unwrap(),
        Regex::new(r"(?i)vbscript:").unwrap(),
        Regex::new(r"(?i)data:text/html").unwrap(),
    ],
    sql_injection: vec![
        Regex::new(r"(?i)\b(union\s+select|select\s+\*\s+from|insert\s+into|delete\s+from|drop\s+table|update\s+\w+\s+set)\b").unwrap(),
        Regex::new(r#"(?i)('\s*or\s+'|"\s*or\s+")"#).unwrap(),
        Regex::new(r"(?m)(--\s*$|;\s*--)").unwrap(),
        Regex::new(r"(?i)\b(exec|execute|xp_|sp_)\b").unwrap(),
        Regex::new(r"0x[0-9a-fA-F]+").unwrap(),
    ],
    command_injection: vec![
        Regex::new(r"[;&|`$]").unwrap(),
        Regex::new(r"\$\([^)]+\)").unwrap(),
        Regex::new(r"`[^`]+`").unwrap(),
        Regex::new(r"(?i)\b(rm\s+-rf|wget|curl|nc\s|netcat|bash|sh\s+-c)\b").unwrap(),
    ],
    path_traversal: vec![
        Regex::new(r"(?i)\.\./").unwrap(),
        Regex::new(r"(?i)\.\.\\").unwrap(),
        Regex::new(r"(?i)%2e%2e%2f").unwrap(),
        Regex::new(r"(?i)%252e%252e%252f").unwrap(),
    ],
    control_chars: Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f-\x9f]").unwrap(),
    html_tag: Regex::new(r"<[^>]+>").unwrap(),
});

/// Validates and sanitizes a single text input.
pub struct InputValidator {
    config: ValidationConfig,
}

impl InputValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, text: &str) -> ValidationResult {
        let original_length = text.chars().count();
        let mut warnings = Vec::new();
        let mut text = text.to_string();

        if original_length > self.config.max_length {
            warnings.push(format!("text exceeds max length ({original_length} > {})", self.config.max_length));
            text = text.chars().take(self.config.max_length).collect();
        }

        if text.chars().count() < self.config.min_length {
            return ValidationResult {
                is_valid: false,
                sanitized_text: String::new(),
                threats_detected: Vec::new(),
                warnings: vec!["text below minimum length".to_string()],
                original_length,
                sanitized_length: 0,
            };
        }

        let line_count = text.matches('\n').count() + 1;
        if line_count > self.config.max_line_count {
            warnings.push(format!("line count exceeds limit ({line_count} > {})", self.config.max_line_count));
        }

        if self.config.normalize_unicode {
            text = unicode_normalization::UnicodeNormalization::nfc(text.as_str()).collect();
        }

        if self.config.block_control_characters {
            let removed = PATTERNS.control_chars.find_iter(&text).count();
            if removed > 0 {
                warnings.push(format!("removed {removed} control characters"));
                text = PATTERNS.control_chars.replace_all(&text, "").to_string();
            }
        }

        let mut threats = Vec::new();

        if PATTERNS.xss.iter().any(|p| p.is_match(&text)) {
            threats.push(ThreatType::Xss);
            warnings.push("XSS pattern detected".to_string());
        }
        if PATTERNS.sql_injection.iter().any(|p| p.is_match(&text)) {
            threats.push(ThreatType::SqlInjection);
            warnings.push("SQL injection pattern detected".to_string());
        }
        if self.config.level == ValidationLevel::Strict && PATTERNS.command_injection.iter().any(|p| p.is_match(&text)) {
            threats.push(ThreatType::CommandInjection);
            warnings.push("command injection pattern detected".to_string());
        }
        if PATTERNS.path_traversal.iter().any(|p| p.is_match(&text)) {
            threats.push(ThreatType::PathTraversal);
            warnings.push("path traversal pattern detected".to_string());
        }

        if self.config.strip_html {
            text = PATTERNS.html_tag.replace_all(&text, "").to_string();
            text = decode_html_entities(&text);
        }

        if self.config.normalize_whitespace {
            text = normalize_whitespace(&text);
        }

        let is_valid = self.determine_validity(&threats);
        let sanitized_length = text.chars().count();

        ValidationResult {
            is_valid,
            sanitized_text: text,
            threats_detected: threats,
            warnings,
            original_length,
            sanitized_length,
        }
    }

    fn determine_validity(&self, threats: &[ThreatType]) -> bool {
        if threats.is_empty() {
            return true;
        }
        match self.config.level {
            ValidationLevel::Permissive => {
                !threats.iter().any(|t| matches!(t, ThreatType::Xss | ThreatType::SqlInjection))
            }
            ValidationLevel::Standard => !threats
                .iter()
                .any(|t| matches!(t, ThreatType::Xss | ThreatType::SqlInjection | ThreatType::PathTraversal)),
            ValidationLevel::Strict => false,
        }
    }
}

/// Decodes the small set of HTML entities that matter post tag-stripping.
/// Not a general HTML parser — just unescapes what `&foo;` sequences a
/// stripped tag might have left behind.
fn decode_html_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
}

fn normalize_whitespace(text: &str) -> String {
    static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" +").unwrap());
    static NEWLINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
    let text = SPACES.replace_all(text, " ");
    let text = NEWLINES.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Validates a batch of inputs with a shared [`InputValidator`].
pub struct BatchValidator {
    validator: InputValidator,
}

impl BatchValidator {
    pub fn new(validator: InputValidator) -> Self {
        Self { validator }
    }

    pub fn validate_batch(&self, texts: &[String]) -> Vec<ValidationResult> {
        texts.iter().map(|text| self.validator.validate(text)).collect()
    }

    pub fn filter_valid(&self, texts: &[String]) -> Vec<String> {
        self.validate_batch(texts).into_iter().filter(|r| r.is_valid).map(|r| r.sanitized_text).collect()
    }
}

/// Quick one-shot validation with default settings; returns an error if
/// the text is rejected rather than a result the caller must inspect.
pub fn sanitize(text: &str, level: ValidationLevel) -> Result<String> {
    let config = ValidationConfig { level, ..Default::default() };
    let result = InputValidator::new(config).validate(text);
    if result.is_valid {
        Ok(result.sanitized_text)
    } else {
        Err(crate::error::Error::validation_failed(result.warnings.join(", ")))
    }
}

/// Kind of PII a [`PiiMasker`] can detect and mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PiiType {
    Email,
    Phone,
    Ssn,
    CreditCard,
}

struct PiiPattern {
    kind: PiiType,
    pattern: &'static Regex,
    replacement: &'static str,
}

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap());
static PHONE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\+?1[-.\s]?)?\(?[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}\b").unwrap());
static SSN_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[0-9]{3}[-\s]?[0-9]{2}[-\s]?[0-9]{4}\b").unwrap());
static CREDIT_CARD_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(?:[0-9]{4}[-\s]?){3}[0-9]{4}\b").unwrap());

fn pii_patterns() -> [PiiPattern; 4] {
    [
        PiiPattern { kind: PiiType::Email, pattern: &EMAIL_PATTERN, replacement: "[EMAIL]" },
        PiiPattern { kind: PiiType::Phone, pattern: &PHONE_PATTERN, replacement: "[PHONE]" },
        PiiPattern { kind: PiiType::Ssn, pattern: &SSN_PATTERN, replacement: "[SSN]" },
        PiiPattern { kind: PiiType::CreditCard, pattern: &CREDIT_CARD_PATTERN, replacement: "[CREDIT_CARD]" },
    ]
}

/// Detects and masks common PII patterns. False positives are expected —
/// this is a best-effort redaction layer, not a compliance guarantee.
pub struct PiiMasker {
    mask_types: HashSet<PiiType>,
}

impl PiiMasker {
    pub fn new(mask_types: HashSet<PiiType>) -> Self {
        Self { mask_types }
    }

    pub fn all() -> Self {
        Self::new([PiiType::Email, PiiType::Phone, PiiType::Ssn, PiiType::CreditCard].into_iter().collect())
    }

    pub fn mask(&self, text: &str) -> String {
        let mut text = text.to_string();
        for pattern in pii_patterns() {
            if self.mask_types.contains(&pattern.kind) {
                text = pattern.pattern.replace_all(&text, pattern.replacement).to_string();
            }
        }
        text
    }

    pub fn detect(&self, text: &str) -> Vec<(PiiType, Vec<String>)> {
        let mut findings = Vec::new();
        for pattern in pii_patterns() {
            if !self.mask_types.contains(&pattern.kind) {
                continue;
            }
            let matches: Vec<String> = pattern.pattern.find_iter(text).map(|m| m.as_str().to_string()).collect();
            if !matches.is_empty() {
                findings.push((pattern.kind, matches));
            }
        }
        findings
    }
}

//! Input hardening for text headed into an AI request pipeline: length and
//! encoding validation with threat-pattern detection, PII masking, and
//! multi-layer prompt injection scoring.

pub mod injection;
pub mod input_validator;

pub use injection::{
    AttackType, DetectionLayer, DetectionResult, DetectionSensitivity, DetectorConfig, HeuristicDetectionLayer,
    PatternDetectionLayer, PromptInjectionDetector,
};
pub use input_validator::{
    BatchValidator, InputValidator, PiiMasker, PiiType, ThreatType, ValidationConfig, ValidationLevel, ValidationResult,
};

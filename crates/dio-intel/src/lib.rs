//! Intelligence generation: prompt, model call, resilient parsing and the
//! deterministic fallback report.

pub mod generator;
pub mod industry;
pub mod intelligence;
pub mod parse;
pub mod prompt;
pub mod report;
pub mod summary;

pub use generator::{
    generate_within, GenerationError, GenerationRequest, HttpTextGenerator, LlmSettings, TextGenerator,
    DEFAULT_LLM_BASE_URL, DEFAULT_LLM_MODEL,
};
pub use industry::{IndustryStrategy, IndustryTable};
pub use intelligence::{industry_name, IntelligenceGenerator, DEFAULT_GENERATION_TIMEOUT};
pub use parse::{ParseError, ParseStrategy, ResponseParser};
pub use prompt::{build_prompt, PromptContext};
pub use report::{data_quality_score, ModelNarrative};
pub use summary::{deterministic_summary, NarrativeSummarizer};

pub const CRATE_NAME: &str = "dio-intel";

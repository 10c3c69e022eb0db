use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dio_core::{Entity, SourcePayload};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::generator::{generate_within, GenerationError, GenerationRequest, TextGenerator};

const MAX_SUMMARY_HEADLINES: usize = 5;

/// Condenses freshly fetched research into a short narrative.
#[derive(Clone)]
pub struct NarrativeSummarizer {
    generator: Option<Arc<dyn TextGenerator>>,
    timeout: Duration,
}

impl NarrativeSummarizer {
    pub fn new(generator: Option<Arc<dyn TextGenerator>>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    pub fn deterministic() -> Self {
        Self::new(None, Duration::from_secs(30))
    }

    /// Never fails: generation problems fall back to a counts-and-headlines digest.
    pub async fn summarize(&self, entity: &Entity, payloads: &BTreeMap<String, SourcePayload>) -> String {
        if payloads.values().all(Vec::is_empty) {
            return deterministic_summary(&entity.company, payloads);
        }
        let Some(generator) = &self.generator else {
            return deterministic_summary(&entity.company, payloads);
        };

        let request = GenerationRequest {
            prompt: summary_prompt(&entity.company, payloads),
            max_tokens: 300,
            temperature: 0.2,
        };
        match generate_within(generator.as_ref(), &request, self.timeout).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!(entity_id = %entity.id, "empty narrative summary, using digest");
                deterministic_summary(&entity.company, payloads)
            }
            Err(err) => {
                log_summary_failure(&entity.id, &err);
                deterministic_summary(&entity.company, payloads)
            }
        }
    }
}

fn log_summary_failure(entity_id: &str, err: &GenerationError) {
    warn!(entity_id, error = %err, "narrative summary generation failed, using digest");
}

fn headlines<'a>(payloads: &'a BTreeMap<String, SourcePayload>) -> impl Iterator<Item = &'a str> {
    payloads
        .values()
        .flatten()
        .filter_map(|item| item.get("title").and_then(JsonValue::as_str))
        .filter(|t| !t.trim().is_empty())
}

fn summary_prompt(company: &str, payloads: &BTreeMap<String, SourcePayload>) -> String {
    let mut prompt = format!(
        "Summarize the following research about {company} in 3-4 plain sentences for a salesperson. \
         Focus on changes that matter for an open deal. Reply with text only.\n\n"
    );
    for (source, items) in payloads {
        prompt.push_str(&format!("## {source}\n"));
        for item in items.iter().take(10) {
            prompt.push_str(&format!("- {item}\n"));
        }
    }
    prompt
}

pub fn deterministic_summary(company: &str, payloads: &BTreeMap<String, SourcePayload>) -> String {
    if payloads.values().all(Vec::is_empty) {
        return format!("No external research found for {company}.");
    }
    let counts: Vec<String> = payloads
        .iter()
        .map(|(source, items)| format!("{source} {}", items.len()))
        .collect();
    let mut summary = format!("Research for {company}: {}.", counts.join(", "));
    let top: Vec<&str> = headlines(payloads).take(MAX_SUMMARY_HEADLINES).collect();
    if !top.is_empty() {
        summary.push_str(&format!(" Headlines: {}.", top.join("; ")));
    }
    summary
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    struct Failing;

    #[async_trait]
    impl TextGenerator for Failing {
        fn model(&self) -> &str {
            "failing"
        }
        async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
            Err(GenerationError::EmptyResponse)
        }
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl TextGenerator for Fixed {
        fn model(&self) -> &str {
            "fixed"
        }
        async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
            assert!(request.prompt.contains("Initech"));
            Ok(self.0.to_string())
        }
    }

    fn entity() -> Entity {
        serde_json::from_value(json!({"id": "e-1", "userId": "u-1", "company": "Initech"})).unwrap()
    }

    fn payloads() -> BTreeMap<String, SourcePayload> {
        BTreeMap::from([
            (
                "news".to_string(),
                vec![json!({"title": "Initech hires new CFO"}), json!({"title": "Initech Q3 results"})],
            ),
            ("discussion".to_string(), vec![]),
        ])
    }

    #[tokio::test]
    async fn failing_generator_falls_back_to_digest() {
        let summarizer = NarrativeSummarizer::new(Some(Arc::new(Failing)), Duration::from_secs(1));
        let summary = summarizer.summarize(&entity(), &payloads()).await;
        assert_eq!(
            summary,
            "Research for Initech: discussion 0, news 2. Headlines: Initech hires new CFO; Initech Q3 results."
        );
    }

    #[tokio::test]
    async fn generator_text_is_used_when_available() {
        let summarizer = NarrativeSummarizer::new(Some(Arc::new(Fixed(" Initech is hiring. "))), Duration::from_secs(1));
        assert_eq!(summarizer.summarize(&entity(), &payloads()).await, "Initech is hiring.");
    }

    #[tokio::test]
    async fn empty_research_is_stated_plainly() {
        let summary = NarrativeSummarizer::deterministic()
            .summarize(&entity(), &BTreeMap::new())
            .await;
        assert_eq!(summary, "No external research found for Initech.");
    }
}

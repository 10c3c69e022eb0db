use dio_core::{NotesAnalysis, Sentiment};

use crate::rules::NotesRules;

/// Pure, bounded extraction of signals from free-text relationship notes.
#[derive(Debug, Clone, Copy)]
pub struct NotesAnalyzer<'r> {
    rules: &'r NotesRules,
}

impl<'r> NotesAnalyzer<'r> {
    pub fn new(rules: &'r NotesRules) -> Self {
        Self { rules }
    }

    pub fn analyze(&self, notes: &str) -> NotesAnalysis {
        let mut analysis = NotesAnalysis::default();
        if notes.trim().is_empty() {
            return analysis;
        }
        let caps = self.rules.caps;

        for sentence in split_sentences(notes) {
            let body = strip_bullet(&sentence);
            if body.ends_with('?') || self.rules.question.is_match(body) {
                push_capped(&mut analysis.questions, body, caps.questions);
            }
            if self.rules.requirement.is_match(body) {
                push_capped(&mut analysis.requirements, body, caps.requirements);
            }
            if self.rules.decision.is_match(body) {
                push_capped(&mut analysis.decision_points, body, caps.decision_points);
            }
            if self.rules.event.is_match(body) {
                push_capped(&mut analysis.upcoming_events, body, caps.upcoming_events);
            }
        }

        for hit in self.rules.urgency.find_iter(notes) {
            let phrase = hit.as_str().to_lowercase();
            push_capped(&mut analysis.urgency_indicators, &phrase, caps.urgency_indicators);
        }

        for rule in &self.rules.topics {
            if analysis.key_topics.len() >= caps.key_topics {
                break;
            }
            if rule.pattern.is_match(notes) {
                analysis.key_topics.push(rule.topic.clone());
            }
        }

        analysis.sentiment = self.sentiment(notes);
        analysis
    }

    /// Majority of keyword hits; ties are neutral.
    pub fn sentiment(&self, notes: &str) -> Sentiment {
        let lower = notes.to_lowercase();
        let mut positive = 0usize;
        let mut negative = 0usize;
        for token in lower.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            if self.rules.positive_words.iter().any(|w| token.starts_with(w.as_str())) {
                positive += 1;
            }
            if self.rules.negative_words.iter().any(|w| token.starts_with(w.as_str())) {
                negative += 1;
            }
        }
        match positive.cmp(&negative) {
            std::cmp::Ordering::Greater => Sentiment::Positive,
            std::cmp::Ordering::Less => Sentiment::Negative,
            std::cmp::Ordering::Equal => Sentiment::Neutral,
        }
    }
}

/// Splits on line breaks and on `.`/`!`/`?` followed by whitespace or end of text.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\n' || c == '\r' {
            flush(&mut sentences, &mut current);
            continue;
        }
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map(|n| n.is_whitespace()).unwrap_or(true);
            if at_boundary {
                flush(&mut sentences, &mut current);
            }
        }
    }
    flush(&mut sentences, &mut current);
    sentences
}

fn flush(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

fn strip_bullet(sentence: &str) -> &str {
    sentence
        .trim_start_matches(|c: char| c == '-' || c == '*' || c == '•' || c.is_whitespace())
        .trim()
}

fn push_capped(list: &mut Vec<String>, item: &str, cap: usize) {
    if list.len() < cap && !item.is_empty() && !list.iter().any(|existing| existing == item) {
        list.push(item.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleBook;

    fn analyze(text: &str) -> NotesAnalysis {
        let rules = RuleBook::builtin().unwrap();
        NotesAnalyzer::new(&rules.notes).analyze(text)
    }

    #[test]
    fn empty_notes_yield_empty_analysis() {
        assert_eq!(analyze(""), NotesAnalysis::default());
        assert_eq!(analyze("   \n\t"), NotesAnalysis::default());
    }

    #[test]
    fn classifies_questions_requirements_and_events() {
        let notes = "Call with Dana (VP Ops).\n\
            - What does onboarding look like?\n\
            - How does pricing scale with seats?\n\
            They need SSO and must have SOC 2 reports.\n\
            Decision expected from the steering committee after the demo next week.\n\
            The team is excited, looks great.";
        let analysis = analyze(notes);

        assert_eq!(
            analysis.questions,
            vec![
                "What does onboarding look like?".to_string(),
                "How does pricing scale with seats?".to_string()
            ]
        );
        assert_eq!(analysis.requirements.len(), 1);
        assert_eq!(analysis.decision_points.len(), 1);
        assert!(analysis.upcoming_events.iter().any(|e| e.contains("demo next week")));
        assert!(analysis.key_topics.contains(&"security".to_string()));
        assert!(analysis.key_topics.contains(&"pricing".to_string()));
        assert_eq!(analysis.sentiment, Sentiment::Positive);
    }

    #[test]
    fn lists_are_capped() {
        let notes = (0..15)
            .map(|i| format!("Question number {i}?"))
            .collect::<Vec<_>>()
            .join(" ");
        let analysis = analyze(&notes);
        assert_eq!(analysis.questions.len(), 10);
    }

    #[test]
    fn sentiment_ties_are_neutral() {
        let rules = RuleBook::builtin().unwrap();
        let analyzer = NotesAnalyzer::new(&rules.notes);
        assert_eq!(analyzer.sentiment("Great call but one concern."), Sentiment::Neutral);
        assert_eq!(analyzer.sentiment("Worried about delays and issues."), Sentiment::Negative);
        assert_eq!(analyzer.sentiment("Quarterly sync."), Sentiment::Neutral);
    }

    #[test]
    fn urgency_phrases_are_collected_once() {
        let analysis = analyze("This is URGENT. Need it asap, really urgent, by Friday.");
        assert_eq!(
            analysis.urgency_indicators,
            vec!["urgent".to_string(), "asap".to_string(), "by friday".to_string()]
        );
    }

    #[test]
    fn sentence_split_keeps_decimals_together() {
        assert_eq!(
            split_sentences("Budget is 2.5M. Next call Tuesday!\nThanks"),
            vec!["Budget is 2.5M.", "Next call Tuesday!", "Thanks"]
        );
    }
}

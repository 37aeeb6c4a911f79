use chrono::{DateTime, Utc};
use deal_memory_schemas::{Fact, FactId, FactStatus};
use std::collections::HashMap;

/// Everything the renderer needs to summarize one `(deal_id, topic)`.
#[derive(Debug, Clone, Default)]
pub struct TopicSnapshot {
    pub deal_id: String,
    pub topic: String,
    /// Every fact in the topic, newest first.
    pub facts: Vec<Fact>,
    /// Unresolved CONTRADICTS pairs.
    pub contradictions: Vec<(FactId, FactId)>,
    /// `(newer, older)` SUPERSEDES pairs.
    pub supersessions: Vec<(FactId, FactId)>,
    /// Chunks of the deal still waiting for deep extraction.
    pub unverified_chunks: usize,
}

impl TopicSnapshot {
    /// Fact ids the rendered summary depends on.
    pub fn dependencies(&self) -> Vec<FactId> {
        self.facts.iter().map(|f| f.id.clone()).collect()
    }
}

/// Markdown renderer for memory files
pub struct TemplateRenderer {
    max_facts: usize,
}

impl TemplateRenderer {
    pub fn new(max_facts: usize) -> Self {
        Self {
            max_facts: max_facts.max(1),
        }
    }

    pub fn render(&self, snapshot: &TopicSnapshot) -> String {
        let by_id: HashMap<&FactId, &Fact> = snapshot.facts.iter().map(|f| (&f.id, f)).collect();
        let mut lines = vec![format!("# {} ({})", snapshot.topic, snapshot.deal_id)];

        if snapshot.facts.is_empty() {
            lines.push(String::new());
            lines.push("No facts recorded for this topic yet.".to_string());
        }

        let validated: Vec<&Fact> = snapshot
            .facts
            .iter()
            .filter(|f| f.status == FactStatus::Validated)
            .collect();
        let unvalidated: Vec<&Fact> = snapshot
            .facts
            .iter()
            .filter(|f| f.status == FactStatus::Unvalidated)
            .collect();

        self.fact_section(&mut lines, "Validated", &validated);
        self.fact_section(&mut lines, "Unvalidated", &unvalidated);

        if !snapshot.contradictions.is_empty() {
            lines.push("\n## Open contradictions".to_string());
            for (a, b) in snapshot.contradictions.iter().take(self.max_facts) {
                if let (Some(a), Some(b)) = (by_id.get(a), by_id.get(b)) {
                    lines.push(format!(
                        "- \"{}\" ({}) vs \"{}\" ({})",
                        self.gist(&a.content),
                        source_label(a),
                        self.gist(&b.content),
                        source_label(b)
                    ));
                }
            }
            lines.push("  Awaiting resolution; neither value is preferred.".to_string());
        }

        if !snapshot.supersessions.is_empty() {
            lines.push("\n## Corrections".to_string());
            for (newer, older) in snapshot.supersessions.iter().take(self.max_facts) {
                if let (Some(newer), Some(older)) = (by_id.get(newer), by_id.get(older)) {
                    lines.push(format!(
                        "- \"{}\" replaced \"{}\" ({})",
                        self.gist(&newer.content),
                        self.gist(&older.content),
                        source_label(older)
                    ));
                }
            }
        }

        if snapshot.unverified_chunks > 0 {
            lines.push(String::new());
            lines.push(format!(
                "_{} chunk(s) from this topic's source documents are still being extracted and are not reflected above._",
                snapshot.unverified_chunks
            ));
        }

        lines.join("\n")
    }

    fn fact_section(&self, lines: &mut Vec<String>, title: &str, facts: &[&Fact]) {
        if facts.is_empty() {
            return;
        }
        lines.push(format!("\n## {}", title));
        for fact in facts.iter().take(self.max_facts) {
            lines.push(format!(
                "- {} ({}, confidence {:.2}, {})",
                fact.content,
                source_label(fact),
                fact.confidence,
                format_relative_time(&fact.discovered_at)
            ));
        }
        if facts.len() > self.max_facts {
            lines.push(format!("- ... and {} more", facts.len() - self.max_facts));
        }
    }

    fn gist(&self, text: &str) -> String {
        if text.chars().count() <= 60 {
            text.to_string()
        } else {
            let short: String = text.chars().take(60).collect();
            format!("{}...", short.trim())
        }
    }
}

fn source_label(fact: &Fact) -> String {
    format!("{} {}", fact.source.document_id, fact.source.locator)
}

fn format_relative_time(rfc3339: &str) -> String {
    if let Ok(dt) = DateTime::parse_from_rfc3339(rfc3339) {
        let duration = Utc::now().signed_duration_since(dt);

        if duration.num_hours() < 1 {
            format!("{}m ago", duration.num_minutes().max(0))
        } else if duration.num_days() < 1 {
            format!("{}h ago", duration.num_hours())
        } else if duration.num_days() < 7 {
            format!("{}d ago", duration.num_days())
        } else {
            format!("{}w ago", duration.num_weeks())
        }
    } else {
        "recently".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deal_memory_schemas::{generate_fact_id, Locator, Source};

    fn fact(content: &str, status: FactStatus, document: &str) -> Fact {
        Fact {
            id: generate_fact_id(),
            deal_id: "deal_1".into(),
            content: content.into(),
            entity_ref: None,
            attribute: Some("revenue".into()),
            value: None,
            period: None,
            topic: "financials".into(),
            confidence: 0.8,
            source: Source::document(document, Locator::Page { page: 2 }),
            chunk_id: None,
            extraction_key: None,
            discovered_at: Utc::now().to_rfc3339(),
            status,
        }
    }

    fn snapshot(facts: Vec<Fact>) -> TopicSnapshot {
        TopicSnapshot {
            deal_id: "deal_1".into(),
            topic: "financials".into(),
            facts,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_topic() {
        let renderer = TemplateRenderer::new(10);
        let result = renderer.render(&snapshot(Vec::new()));
        assert!(result.contains("# financials (deal_1)"));
        assert!(result.contains("No facts recorded"));
    }

    #[test]
    fn test_sections_by_status() {
        let renderer = TemplateRenderer::new(10);
        let result = renderer.render(&snapshot(vec![
            fact("FY2023 revenue = 4M", FactStatus::Validated, "audit"),
            fact("FY2024 revenue = 5M", FactStatus::Unvalidated, "deck"),
        ]));
        assert!(result.contains("## Validated\n- FY2023 revenue = 4M (audit p.2"));
        assert!(result.contains("## Unvalidated\n- FY2024 revenue = 5M (deck p.2"));
        assert!(!result.contains("Open contradictions"));
    }

    #[test]
    fn test_contradictions_and_corrections() {
        let renderer = TemplateRenderer::new(10);
        let a = fact("Q3 revenue = 5.2M", FactStatus::Contradicted, "deck");
        let b = fact("Q3 revenue = 5.0M", FactStatus::Contradicted, "audit");
        let old = fact("Headcount = 80", FactStatus::Superseded, "report");
        let new = fact("Headcount = 85", FactStatus::Validated, "report_corrected");
        let mut snap = snapshot(vec![a.clone(), b.clone(), old.clone(), new.clone()]);
        snap.contradictions = vec![(a.id.clone(), b.id.clone())];
        snap.supersessions = vec![(new.id.clone(), old.id.clone())];
        snap.unverified_chunks = 2;

        let result = renderer.render(&snap);
        assert!(result.contains("\"Q3 revenue = 5.2M\" (deck p.2) vs \"Q3 revenue = 5.0M\" (audit p.2)"));
        assert!(result.contains("\"Headcount = 85\" replaced \"Headcount = 80\""));
        assert!(result.contains("2 chunk(s)"));
        // Contradicted and superseded facts are not listed as plain facts.
        assert!(!result.contains("- Q3 revenue = 5.2M ("));
        assert!(!result.contains("- Headcount = 80 ("));
    }

    #[test]
    fn test_long_lists_are_truncated() {
        let renderer = TemplateRenderer::new(2);
        let facts = (0..5)
            .map(|i| fact(&format!("Metric {} = {}", i, i), FactStatus::Unvalidated, "deck"))
            .collect();
        let result = renderer.render(&snapshot(facts));
        assert!(result.contains("... and 3 more"));
    }
}

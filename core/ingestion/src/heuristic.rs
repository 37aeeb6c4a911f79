use deal_memory_schemas::{EntityType, FactValue, KnownEntityType, Period};
use regex::{Captures, Regex};
use std::ops::Range;
use tracing::debug;

/// Confidence score for extracted facts (0.0 to 1.0)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Confidence(f32);

impl Confidence {
    pub fn new(score: f32) -> Self {
        Self(score.clamp(0.0, 1.0))
    }

    pub fn score(&self) -> f32 {
        self.0
    }

    pub fn is_confident(&self) -> bool {
        self.0 >= 0.7
    }
}

/// Entity mention as named by an extractor, before resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: EntityType,
}

impl ExtractedEntity {
    pub fn known(name: impl Into<String>, known: KnownEntityType) -> Self {
        Self {
            name: name.into(),
            entity_type: EntityType::known(known),
        }
    }

    pub fn dynamic(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: EntityType::Dynamic {
                name: type_name.into(),
            },
        }
    }
}

/// Fact candidate produced by an extractor.
#[derive(Debug, Clone)]
pub struct ExtractedFact {
    pub content: String,
    /// Entity the fact is about. Facts sharing subject and attribute are compared.
    pub subject: Option<ExtractedEntity>,
    pub attribute: Option<String>,
    pub value: Option<FactValue>,
    pub period: Option<Period>,
    pub topic: String,
    pub confidence: Confidence,
    /// Other entities named alongside the fact.
    pub mentions: Vec<ExtractedEntity>,
}

/// Everything an extractor pulled out of one chunk of text.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub facts: Vec<ExtractedFact>,
    /// The text announces itself as a correction ("Correction: ...", "Erratum").
    pub correction_signal: bool,
}

const METRIC_WORDS: &[&str] = &[
    "revenue", "revenues", "sales", "turnover", "ebitda", "ebit", "margin", "income", "profit",
    "earnings", "arr", "mrr", "headcount", "employees", "fte", "customers", "clients", "churn",
    "retention", "nrr", "nps", "cash", "debt", "valuation", "price", "bookings", "backlog",
    "growth", "capex", "opex", "burn", "gmv", "ceo", "cfo", "cto", "coo", "founder",
    "chairman", "headquarters", "hq", "users", "units", "expenses", "costs",
];

const QUALIFIER_WORDS: &[&str] = &[
    "gross", "net", "operating", "annual", "annualized", "recurring", "adjusted", "free",
    "monthly", "quarterly", "total", "recognized", "deferred", "contribution", "organic",
    "customer", "employee", "team",
];

const FILLER_WORDS: &[&str] = &[
    "for", "the", "in", "of", "a", "an", "our", "its", "their", "during", "at", "to", "reported",
    "total", "and", "-", "–",
];

const PERSON_ROLES: &[&str] = &["ceo", "cfo", "cto", "coo", "founder", "chairman", "president"];

/// Regex-driven fact extractor for deal documents. Always available; the
/// LLM extractor falls back to it.
pub struct HeuristicExtractor {
    sentence_split: Regex,
    correction_prefix: Regex,
    separator: Regex,
    value: Regex,
    name_list: Regex,
    quarter: Regex,
    half: Regex,
    fiscal_year: Regex,
    month: Regex,
    bare_year: Regex,
    correction_phrase: Regex,
}

impl Default for HeuristicExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicExtractor {
    pub fn new() -> Self {
        Self {
            sentence_split: Regex::new(r"[.!?](?:\s+|$)|[\n;]+").unwrap(),
            correction_prefix: Regex::new(
                r"(?i)^\s*(?:correction|corrected|erratum|errata|restatement|restated|amendment|update|actually)\b\s*[:,\-–]?\s*",
            )
            .unwrap(),
            separator: Regex::new(
                r"(?i)\s*(?:=|:|\bshould\s+be\b|\bcame\s+in\s+at\b|\bstood\s+at\b|\btotal(?:l)?ed\b|\breached\b|\bwas\b|\bwere\b|\bis\b|\bare\b)\s*",
            )
            .unwrap(),
            value: Regex::new(
                r"(?i)^(?P<code>usd|eur|gbp)?\s*(?P<cur>[$€£])?\s*(?P<num>-?\d{1,3}(?:,\d{3})+(?:\.\d+)?|-?\d+(?:\.\d+)?)\s*(?P<scale>mm|bn|million|billion|thousand|k|m|b)?\b\s*(?P<unit>%|percent|usd|eur|gbp|employees|customers|people|users)?",
            )
            .unwrap(),
            name_list: Regex::new(
                r"(?i)^\s*(?:key\s+|top\s+|major\s+|main\s+)?(customers|clients|investors|competitors|partners|suppliers|shareholders)\s+(?:include|includes|including|are|:)\s+(.+)$",
            )
            .unwrap(),
            quarter: Regex::new(r"(?i)\bQ([1-4])(?:\s*(?:FY)?\s*'?(\d{4}|\d{2})\b)?").unwrap(),
            half: Regex::new(r"(?i)\bH([12])(?:\s*(?:FY)?\s*'?(\d{4}|\d{2})\b)?").unwrap(),
            fiscal_year: Regex::new(r"(?i)\b(?:FY|fiscal\s+year\s+|fiscal\s+)'?(\d{4}|\d{2})\b")
                .unwrap(),
            month: Regex::new(
                r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+(\d{4})\b",
            )
            .unwrap(),
            bare_year: Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap(),
            correction_phrase: Regex::new(
                r"(?i)\b(correction|actually|should\s+be|restated|revised|corrected|erratum)\b",
            )
            .unwrap(),
        }
    }

    /// Extract every fact candidate from a chunk of text.
    pub fn extract(&self, text: &str) -> Extraction {
        // "update"/"actually" open analyst remarks, not document errata.
        let correction_signal = self
            .correction_prefix
            .find(text)
            .map(|m| {
                let lead = m.as_str().trim().to_lowercase();
                !lead.starts_with("update") && !lead.starts_with("actually")
            })
            .unwrap_or(false);

        let facts: Vec<ExtractedFact> = self
            .sentence_split
            .split(text)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|sentence| self.extract_statement(sentence))
            .collect();

        debug!(
            "Heuristic extractor found {} facts (correction signal: {})",
            facts.len(),
            correction_signal
        );

        Extraction {
            facts,
            correction_signal,
        }
    }

    /// Parse a single statement ("Q3 revenue = 5.2M") into a fact candidate.
    pub fn extract_statement(&self, sentence: &str) -> Option<ExtractedFact> {
        let statement = self.correction_prefix.replace(sentence, "");
        let statement = statement.trim().trim_end_matches(['.', '!', '?']);
        if statement.is_empty() {
            return None;
        }

        if let Some(fact) = self.extract_name_list(statement) {
            return Some(fact);
        }

        let separator = self.separator.find(statement)?;
        let explicit_assignment = matches!(separator.as_str().trim(), "=" | ":");
        let left = &statement[..separator.start()];
        let right = statement[separator.end()..].trim();
        if left.trim().is_empty() || right.is_empty() {
            return None;
        }

        let (period, period_spans) = self.parse_period_spans(left);
        let subject_text = remove_spans(left, &period_spans);
        let (entity_name, attribute) = split_subject(&subject_text)?;
        let numeric_metric = is_numeric_metric(&attribute);

        let value = match self.parse_value(right) {
            Some(value) => value,
            None => {
                let word_count = right.split_whitespace().count();
                if numeric_metric || word_count > 8 || attribute.split(' ').count() > 4 {
                    return None;
                }
                FactValue::Text {
                    text: right.trim_end_matches([',', ';']).to_string(),
                }
            }
        };

        let mut mentions = Vec::new();
        let subject = match &entity_name {
            Some(name) => {
                let entity = ExtractedEntity::known(name.clone(), KnownEntityType::Company);
                mentions.push(entity.clone());
                entity
            }
            None if matches!(value, FactValue::Numeric { .. }) => {
                ExtractedEntity::known(attribute.clone(), KnownEntityType::Metric)
            }
            None if PERSON_ROLES.contains(&attribute.as_str()) => {
                ExtractedEntity::dynamic(attribute.clone(), "role")
            }
            None => ExtractedEntity::dynamic(attribute.clone(), "attribute"),
        };

        if let FactValue::Text { text } = &value {
            if PERSON_ROLES.contains(&attribute.as_str()) && starts_uppercase(text) {
                mentions.push(ExtractedEntity::known(text.clone(), KnownEntityType::Person));
            }
        }

        let mut confidence: f32 = 0.55;
        if matches!(value, FactValue::Numeric { .. }) {
            confidence += 0.15;
        }
        if period.is_some() {
            confidence += 0.1;
        }
        if entity_name.is_some() {
            confidence += 0.05;
        }
        if explicit_assignment {
            confidence += 0.05;
        }

        Some(ExtractedFact {
            content: statement.to_string(),
            subject: Some(subject),
            topic: infer_topic(&attribute),
            attribute: Some(attribute),
            value: Some(value),
            period,
            confidence: Confidence::new(confidence.min(0.9)),
            mentions,
        })
    }

    /// "Key customers include Walmart, Target and Costco".
    fn extract_name_list(&self, statement: &str) -> Option<ExtractedFact> {
        let caps = self.name_list.captures(statement)?;
        let group = caps.get(1)?.as_str().to_lowercase();
        let attribute = match group.as_str() {
            "clients" => "customers".to_string(),
            "shareholders" => "investors".to_string(),
            other => other.to_string(),
        };

        let names: Vec<String> = caps
            .get(2)?
            .as_str()
            .split(|c| c == ',' || c == '&')
            .flat_map(|part| part.split(" and "))
            .map(|name| name.trim().trim_end_matches('.').to_string())
            .filter(|name| !name.is_empty() && starts_uppercase(name))
            .collect();
        if names.is_empty() {
            return None;
        }

        let mentions = names
            .iter()
            .map(|name| ExtractedEntity::known(name.clone(), KnownEntityType::Company))
            .collect();

        Some(ExtractedFact {
            content: statement.to_string(),
            subject: Some(ExtractedEntity::dynamic(attribute.clone(), "group")),
            topic: infer_topic(&attribute),
            attribute: Some(attribute),
            value: Some(FactValue::Text {
                text: names.join(", "),
            }),
            period: None,
            confidence: Confidence::new(0.6),
            mentions,
        })
    }

    /// Parse the first period mention in `text`.
    pub fn parse_period(&self, text: &str) -> Option<Period> {
        self.parse_period_spans(text).0
    }

    fn parse_period_spans(&self, text: &str) -> (Option<Period>, Vec<Range<usize>>) {
        let bare_year = self.bare_year.captures(text);
        let year_from_bare = |caps: &Option<Captures>| {
            caps.as_ref()
                .and_then(|c| c.get(1))
                .map(|m| (m.as_str().parse::<i32>().ok(), m.range()))
        };

        for (regex, build) in [
            (&self.quarter, Period::quarter as fn(u32, Option<i32>) -> Option<Period>),
            (&self.half, Period::half as fn(u32, Option<i32>) -> Option<Period>),
        ] {
            if let Some(caps) = regex.captures(text) {
                let Some(whole) = caps.get(0) else { continue };
                let number = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok());
                let mut spans = vec![whole.range()];
                let mut year = caps.get(2).map(|m| expand_year(m.as_str()));
                if year.is_none() {
                    if let Some((Some(bare), range)) = year_from_bare(&bare_year) {
                        year = Some(bare);
                        spans.push(range);
                    }
                }
                if let Some(period) = number.and_then(|n| build(n, year)) {
                    return (Some(period), spans);
                }
            }
        }

        if let Some(caps) = self.fiscal_year.captures(text) {
            if let (Some(whole), Some(year)) = (caps.get(0), caps.get(1)) {
                if let Some(period) = Period::year(expand_year(year.as_str())) {
                    return (Some(period), vec![whole.range()]);
                }
            }
        }

        if let Some(caps) = self.month.captures(text) {
            if let (Some(whole), Some(month), Some(year)) = (caps.get(0), caps.get(1), caps.get(2))
            {
                let month = month_number(month.as_str());
                let year = year.as_str().parse::<i32>().ok();
                if let Some(period) = month.zip(year).and_then(|(m, y)| Period::month(m, y)) {
                    return (Some(period), vec![whole.range()]);
                }
            }
        }

        if let Some((Some(year), range)) = year_from_bare(&bare_year) {
            if let Some(period) = Period::year(year) {
                return (Some(period), vec![range]);
            }
        }

        (None, Vec::new())
    }

    /// Parse a leading numeric value ("$5.2M", "42%", "1,200 employees").
    pub fn parse_value(&self, text: &str) -> Option<FactValue> {
        let caps = self.value.captures(text.trim())?;
        let raw = caps.name("num")?.as_str().replace(',', "");
        let number: f64 = raw.parse().ok()?;

        let multiplier = match caps
            .name("scale")
            .map(|m| m.as_str().to_lowercase())
            .as_deref()
        {
            Some("k") | Some("thousand") => 1e3,
            Some("m") | Some("mm") | Some("million") => 1e6,
            Some("b") | Some("bn") | Some("billion") => 1e9,
            _ => 1.0,
        };

        let unit = if let Some(cur) = caps.name("cur") {
            Some(
                match cur.as_str() {
                    "€" => "EUR",
                    "£" => "GBP",
                    _ => "USD",
                }
                .to_string(),
            )
        } else if let Some(code) = caps.name("code") {
            Some(code.as_str().to_uppercase())
        } else {
            caps.name("unit").map(|u| match u.as_str().to_lowercase().as_str() {
                "%" | "percent" => "%".to_string(),
                "usd" | "eur" | "gbp" => u.as_str().to_uppercase(),
                other => other.to_string(),
            })
        };

        let amount = (number * multiplier * 1000.0).round() / 1000.0;
        Some(FactValue::Numeric { amount, unit })
    }

    /// Whether an analyst statement reads as a correction of an earlier value.
    pub fn is_correction_statement(&self, text: &str) -> bool {
        self.correction_phrase.is_match(text)
    }
}

/// Split the subject side into an optional entity name and a normalized attribute.
fn split_subject(subject: &str) -> Option<(Option<String>, String)> {
    let words: Vec<String> = subject
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| matches!(c, ',' | '(' | ')' | '"' | '\''))
                .trim_end_matches("'s")
                .trim_end_matches("’s")
                .to_string()
        })
        .filter(|w| !w.is_empty())
        .filter(|w| !FILLER_WORDS.contains(&w.to_lowercase().as_str()))
        .collect();

    let entity_len = words
        .iter()
        .take_while(|w| {
            let lower = w.to_lowercase();
            starts_uppercase(w)
                && !METRIC_WORDS.contains(&lower.as_str())
                && !QUALIFIER_WORDS.contains(&lower.as_str())
        })
        .count();

    let (entity_words, attribute_words) = words.split_at(entity_len);
    let attribute = normalize_attribute(&attribute_words.join(" "));
    if attribute.is_empty() || attribute_words.len() > 5 {
        return None;
    }

    let entity = if entity_words.is_empty() {
        None
    } else {
        Some(entity_words.join(" "))
    };
    Some((entity, attribute))
}

/// Lowercase, collapse whitespace and fold common synonyms ("sales" -> "revenue").
pub fn normalize_attribute(raw: &str) -> String {
    let lowered = raw
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    match lowered.as_str() {
        "revenues" | "sales" | "net sales" | "turnover" | "total revenue" | "net revenue"
        | "net revenues" => "revenue".to_string(),
        "employees" | "employee count" | "team size" | "fte" | "ftes" | "staff" => {
            "headcount".to_string()
        }
        "clients" | "customer count" | "client count" => "customers".to_string(),
        "hq" => "headquarters".to_string(),
        _ => lowered,
    }
}

/// Topic bucket (memory file key) for an attribute.
pub fn infer_topic(attribute: &str) -> String {
    const FINANCIAL: &[&str] = &[
        "revenue", "ebitda", "ebit", "margin", "income", "profit", "earnings", "cash", "debt",
        "arr", "mrr", "capex", "opex", "burn", "valuation", "bookings", "backlog", "growth",
        "gmv", "price", "expenses", "costs",
    ];
    const TEAM: &[&str] = &[
        "headcount", "ceo", "cfo", "cto", "coo", "founder", "chairman", "president",
    ];
    const CUSTOMERS: &[&str] = &["customers", "churn", "retention", "nrr", "nps", "users"];

    let has = |words: &[&str]| attribute.split(' ').any(|w| words.contains(&w));
    if has(FINANCIAL) {
        "financials".to_string()
    } else if has(TEAM) {
        "team".to_string()
    } else if has(CUSTOMERS) {
        "customers".to_string()
    } else if attribute == "investors" || attribute == "competitors" {
        "market".to_string()
    } else {
        "general".to_string()
    }
}

fn is_numeric_metric(attribute: &str) -> bool {
    infer_topic(attribute) == "financials" || attribute == "headcount"
}

fn starts_uppercase(text: &str) -> bool {
    text.chars().next().map(char::is_uppercase).unwrap_or(false)
}

fn expand_year(raw: &str) -> i32 {
    let year: i32 = raw.parse().unwrap_or(0);
    if raw.len() == 2 {
        2000 + year
    } else {
        year
    }
}

fn month_number(raw: &str) -> Option<u32> {
    let index = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ]
    .iter()
    .position(|m| raw.to_lowercase().starts_with(m))?;
    Some(index as u32 + 1)
}

fn remove_spans(text: &str, spans: &[Range<usize>]) -> String {
    let mut sorted = spans.to_vec();
    sorted.sort_by_key(|r| r.start);

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in sorted {
        if span.start >= cursor {
            out.push_str(&text[cursor..span.start]);
            out.push(' ');
            cursor = span.end;
        }
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_quarter_metric_assignment() {
        let extractor = HeuristicExtractor::new();
        let fact = extractor.extract_statement("Q3 revenue = 5.2M").unwrap();

        assert_eq!(fact.attribute.as_deref(), Some("revenue"));
        assert_eq!(fact.period, Period::quarter(3, None));
        assert_eq!(
            fact.value,
            Some(FactValue::Numeric {
                amount: 5_200_000.0,
                unit: None
            })
        );
        assert_eq!(
            fact.subject,
            Some(ExtractedEntity::known("revenue", KnownEntityType::Metric))
        );
        assert_eq!(fact.topic, "financials");
        assert!(fact.confidence.is_confident());
    }

    #[test]
    fn test_fiscal_year_and_verb_separator() {
        let extractor = HeuristicExtractor::new();
        let a = extractor.extract_statement("FY2023 revenue = 4M").unwrap();
        let b = extractor.extract_statement("Revenue for FY2024 was $5M").unwrap();

        assert_eq!(a.period, Period::year(2023));
        assert_eq!(b.period, Period::year(2024));
        assert_eq!(b.attribute.as_deref(), Some("revenue"));
        assert_eq!(
            b.value,
            Some(FactValue::Numeric {
                amount: 5_000_000.0,
                unit: Some("USD".into())
            })
        );
    }

    #[test]
    fn test_company_subject_and_percentage() {
        let extractor = HeuristicExtractor::new();
        let fact = extractor
            .extract_statement("Acme Corp Q3 2023 gross margin: 42%")
            .unwrap();

        assert_eq!(
            fact.subject,
            Some(ExtractedEntity::known("Acme Corp", KnownEntityType::Company))
        );
        assert_eq!(fact.attribute.as_deref(), Some("gross margin"));
        let period = fact.period.unwrap();
        assert_eq!(period.start, NaiveDate::from_ymd_opt(2023, 7, 1));
        assert_eq!(
            fact.value,
            Some(FactValue::Numeric {
                amount: 42.0,
                unit: Some("%".into())
            })
        );
    }

    #[test]
    fn test_quarter_picks_up_separate_year() {
        let extractor = HeuristicExtractor::new();
        let period = extractor.parse_period("Q2 revenue in 2024").unwrap();
        assert_eq!(period.label, "Q2 2024");
        assert!(period.is_bounded());
    }

    #[test]
    fn test_month_period() {
        let extractor = HeuristicExtractor::new();
        let period = extractor.parse_period("March 2024 bookings").unwrap();
        assert_eq!(period.start, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(period.end, NaiveDate::from_ymd_opt(2024, 3, 31));
    }

    #[test]
    fn test_name_list_mentions() {
        let extractor = HeuristicExtractor::new();
        let fact = extractor
            .extract_statement("Key customers include Walmart, Target and Costco")
            .unwrap();
        assert_eq!(fact.attribute.as_deref(), Some("customers"));
        assert_eq!(fact.mentions.len(), 3);
        assert_eq!(fact.mentions[2].name, "Costco");
    }

    #[test]
    fn test_text_fact_with_person() {
        let extractor = HeuristicExtractor::new();
        let fact = extractor.extract_statement("CEO: Jane Smith").unwrap();
        assert_eq!(fact.attribute.as_deref(), Some("ceo"));
        assert_eq!(fact.topic, "team");
        assert_eq!(
            fact.mentions,
            vec![ExtractedEntity::known("Jane Smith", KnownEntityType::Person)]
        );
    }

    #[test]
    fn test_correction_prefix_and_signal() {
        let extractor = HeuristicExtractor::new();
        let extraction = extractor.extract("Correction: Q3 revenue = 5.1M. Headcount = 120.");
        assert!(extraction.correction_signal);
        assert_eq!(extraction.facts.len(), 2);
        assert_eq!(extraction.facts[0].content, "Q3 revenue = 5.1M");
        assert_eq!(extraction.facts[1].attribute.as_deref(), Some("headcount"));

        assert!(!extractor.extract("Q3 revenue = 5.1M").correction_signal);
        assert!(extractor.is_correction_statement("Actually Q3 revenue should be 5.1M"));
    }

    #[test]
    fn test_prose_is_ignored() {
        let extractor = HeuristicExtractor::new();
        assert!(extractor
            .extract("We met the management team and toured the plant")
            .facts
            .is_empty());
        // A financial metric with a non-numeric value is not a fact.
        assert!(extractor.extract_statement("Revenue was strong").is_none());
    }

    #[test]
    fn test_confidence_scoring() {
        let c = Confidence::new(1.5);
        assert_eq!(c.score(), 1.0);
        assert!(!Confidence::new(0.5).is_confident());
    }
}

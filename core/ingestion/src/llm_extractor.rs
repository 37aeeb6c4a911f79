use anyhow::{Context, Result};
use deal_memory_schemas::{EntityType, FactValue, KnownEntityType};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::heuristic::{
    infer_topic, normalize_attribute, Confidence, ExtractedEntity, ExtractedFact, Extraction,
    HeuristicExtractor,
};

/// Configuration for LLM-based extraction
#[derive(Debug, Clone)]
pub struct LLMConfig {
    pub provider: LLMProvider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LLMProvider {
    Ollama,
    OpenAI,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: LLMProvider::Ollama,
            api_key: None,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_secs: 60,
        }
    }
}

impl LLMConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self> {
        let provider = std::env::var("LLM_PROVIDER")
            .unwrap_or_else(|_| "ollama".to_string())
            .to_lowercase();

        let provider = match provider.as_str() {
            "openai" => LLMProvider::OpenAI,
            _ => LLMProvider::Ollama,
        };

        let base_url = match provider {
            LLMProvider::Ollama => {
                std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
            }
            LLMProvider::OpenAI => std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
        };

        let model = match provider {
            LLMProvider::Ollama => {
                std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2:3b".to_string())
            }
            LLMProvider::OpenAI => {
                std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string())
            }
        };

        let api_key = if provider == LLMProvider::OpenAI {
            Some(
                std::env::var("OPENAI_API_KEY")
                    .context("OPENAI_API_KEY required for OpenAI provider")?,
            )
        } else {
            None
        };

        let timeout_secs = std::env::var("LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(60);

        Ok(Self {
            provider,
            api_key,
            base_url,
            model,
            timeout_secs,
        })
    }
}

/// LLM response for extraction
#[derive(Debug, Deserialize, Serialize)]
struct ExtractionResponse {
    #[serde(default)]
    correction: bool,
    facts: Vec<ExtractedFactData>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ExtractedFactData {
    content: String,
    entity: Option<EntityData>,
    attribute: Option<String>,
    value: Option<serde_json::Value>,
    unit: Option<String>,
    period: Option<String>,
    topic: Option<String>,
    confidence: f32,
    #[serde(default)]
    mentions: Vec<EntityData>,
}

#[derive(Debug, Deserialize, Serialize)]
struct EntityData {
    name: String,
    #[serde(rename = "type")]
    entity_type: Option<String>,
}

/// LLM-based extractor for deal documents
pub struct LLMExtractor {
    config: LLMConfig,
    client: Client,
    periods: HeuristicExtractor,
}

impl LLMExtractor {
    pub fn new(config: LLMConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            client,
            periods: HeuristicExtractor::new(),
        })
    }

    /// Try to create from environment, returns None if LLM extraction is disabled
    pub fn from_env_optional() -> Option<Self> {
        let use_llm = std::env::var("USE_LLM_EXTRACTION")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase();

        if use_llm == "true" || use_llm == "1" {
            match LLMConfig::from_env().and_then(Self::new) {
                Ok(extractor) => Some(extractor),
                Err(e) => {
                    warn!("Failed to initialize LLM extractor: {}", e);
                    None
                }
            }
        } else {
            None
        }
    }

    /// Extract facts from chunk text using the configured model
    pub async fn extract(&self, text: &str, document_type: Option<&str>) -> Result<Extraction> {
        let prompt = self.build_extraction_prompt(text, document_type);

        let response = match self.config.provider {
            LLMProvider::Ollama => self.call_ollama(&prompt).await?,
            LLMProvider::OpenAI => self.call_openai(&prompt).await?,
        };

        self.parse_llm_response(&response)
    }

    fn build_extraction_prompt(&self, text: &str, document_type: Option<&str>) -> String {
        format!(
            r#"Extract atomic, verifiable facts from the following excerpt of a deal document.
For every fact identify:
1. ENTITY - the company, person, product or metric the fact is about
2. ATTRIBUTE - the measured property (e.g. revenue, gross margin, headcount, ceo)
3. VALUE - a number (with unit) or a short text value
4. PERIOD - the time window, e.g. "FY2023", "Q3 2023", "H1 2024", "March 2024"

Also report whether the excerpt presents itself as a correction or restatement.

Document type: {}

Excerpt:
{}

Return a JSON object with this structure:
{{
  "correction": false,
  "facts": [
    {{
      "content": "the fact as a short sentence",
      "entity": {{ "name": "Acme Corp", "type": "company|person|metric|product|location|<other>" }},
      "attribute": "revenue",
      "value": 5200000,
      "unit": "USD",
      "period": "Q3 2023",
      "topic": "financials|team|customers|market|general",
      "confidence": 0.0-1.0,
      "mentions": [{{ "name": "...", "type": "..." }}]
    }}
  ]
}}

Only extract facts stated in the excerpt. Do not infer or compute values."#,
            document_type.unwrap_or("unknown"),
            text
        )
    }

    async fn call_ollama(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.config.base_url);

        let request_body = json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "format": "json",
            "options": {
                "temperature": 0.1,
                "num_predict": 2048,
            }
        });

        debug!("Calling Ollama at {}", url);

        let response = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .context("Failed to call Ollama API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error {}: {}", status, error_text);
        }

        #[derive(Deserialize)]
        struct OllamaResponse {
            response: String,
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        Ok(ollama_response.response)
    }

    async fn call_openai(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);

        let request_body = json!({
            "model": self.config.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You extract structured facts from financial due-diligence documents and return valid JSON."
                },
                {
                    "role": "user",
                    "content": prompt
                }
            ],
            "temperature": 0.1,
            "max_tokens": 2048,
            "response_format": { "type": "json_object" }
        });

        debug!("Calling OpenAI at {}", url);

        let mut request = self.client.post(&url).json(&request_body);

        if let Some(ref api_key) = self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.context("Failed to call OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {}: {}", status, error_text);
        }

        #[derive(Deserialize)]
        struct OpenAIResponse {
            choices: Vec<OpenAIChoice>,
        }

        #[derive(Deserialize)]
        struct OpenAIChoice {
            message: OpenAIMessage,
        }

        #[derive(Deserialize)]
        struct OpenAIMessage {
            content: String,
        }

        let openai_response: OpenAIResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI response")?;

        openai_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from OpenAI"))
    }

    fn parse_llm_response(&self, response: &str) -> Result<Extraction> {
        let extraction: ExtractionResponse = serde_json::from_str(response)
            .context("Failed to parse LLM extraction response")?;

        let mut facts = Vec::new();

        for data in extraction.facts {
            if data.content.trim().is_empty() {
                continue;
            }

            let attribute = data
                .attribute
                .as_deref()
                .map(normalize_attribute)
                .filter(|a| !a.is_empty());

            let value = match data.value {
                Some(serde_json::Value::Number(n)) => n.as_f64().map(|amount| FactValue::Numeric {
                    amount,
                    unit: data.unit.clone().filter(|u| !u.trim().is_empty()),
                }),
                Some(serde_json::Value::String(s)) if !s.trim().is_empty() => self
                    .periods
                    .parse_value(&s)
                    .or(Some(FactValue::Text { text: s })),
                Some(serde_json::Value::Null) | None => None,
                Some(other) => {
                    warn!("Ignoring non-scalar fact value: {}", other);
                    None
                }
            };

            let period = data
                .period
                .as_deref()
                .and_then(|raw| self.periods.parse_period(raw));

            let topic = data.topic.unwrap_or_else(|| {
                attribute
                    .as_deref()
                    .map(infer_topic)
                    .unwrap_or_else(|| "general".to_string())
            });

            facts.push(ExtractedFact {
                content: data.content,
                subject: data.entity.map(into_entity),
                attribute,
                value,
                period,
                topic,
                confidence: Confidence::new(data.confidence),
                mentions: data.mentions.into_iter().map(into_entity).collect(),
            });
        }

        debug!("LLM extracted {} facts", facts.len());
        Ok(Extraction {
            facts,
            correction_signal: extraction.correction,
        })
    }
}

fn into_entity(data: EntityData) -> ExtractedEntity {
    let entity_type = match data.entity_type.as_deref().map(str::to_lowercase).as_deref() {
        Some("company") | Some("organization") => EntityType::known(KnownEntityType::Company),
        Some("person") => EntityType::known(KnownEntityType::Person),
        Some("metric") => EntityType::known(KnownEntityType::Metric),
        Some("product") => EntityType::known(KnownEntityType::Product),
        Some("location") => EntityType::known(KnownEntityType::Location),
        Some(other) if !other.is_empty() => EntityType::Dynamic {
            name: other.to_string(),
        },
        _ => EntityType::Dynamic {
            name: "unknown".to_string(),
        },
    };

    ExtractedEntity {
        name: data.name,
        entity_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deal_memory_schemas::Period;

    #[test]
    fn test_extraction_prompt() {
        let extractor = LLMExtractor::new(LLMConfig::default()).unwrap();

        let prompt = extractor.build_extraction_prompt("Q3 revenue = 5.2M", Some("pdf"));
        assert!(prompt.contains("ENTITY"));
        assert!(prompt.contains("PERIOD"));
        assert!(prompt.contains("Document type: pdf"));
        assert!(prompt.contains("Q3 revenue = 5.2M"));
    }

    #[test]
    fn test_parse_llm_response() {
        let extractor = LLMExtractor::new(LLMConfig::default()).unwrap();

        let llm_response = r#"{
            "correction": true,
            "facts": [
                {
                    "content": "Acme Q3 2023 revenue was $5.2M",
                    "entity": { "name": "Acme", "type": "company" },
                    "attribute": "Sales",
                    "value": 5200000,
                    "unit": "USD",
                    "period": "Q3 2023",
                    "confidence": 0.9,
                    "mentions": [{ "name": "North America", "type": "region" }]
                },
                {
                    "content": "The CEO is Jane Smith",
                    "entity": { "name": "Jane Smith", "type": "person" },
                    "attribute": "ceo",
                    "value": "Jane Smith",
                    "confidence": 0.8
                }
            ]
        }"#;

        let extraction = extractor.parse_llm_response(llm_response).unwrap();
        assert!(extraction.correction_signal);
        assert_eq!(extraction.facts.len(), 2);

        let revenue = &extraction.facts[0];
        assert_eq!(revenue.attribute.as_deref(), Some("revenue"));
        assert_eq!(revenue.topic, "financials");
        assert_eq!(revenue.period, Period::quarter(3, Some(2023)));
        assert_eq!(
            revenue.mentions[0].entity_type,
            EntityType::Dynamic {
                name: "region".into()
            }
        );
        assert!(revenue.confidence.is_confident());

        assert_eq!(
            extraction.facts[1].value,
            Some(FactValue::Text {
                text: "Jane Smith".into()
            })
        );
    }

    #[test]
    fn test_malformed_response_is_an_error() {
        let extractor = LLMExtractor::new(LLMConfig::default()).unwrap();
        assert!(extractor.parse_llm_response("not json").is_err());
    }
}

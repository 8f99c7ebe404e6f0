//! Field recommendations with a bounded timeout and a deterministic fallback.
//!
//! Defines the [`Recommender`] trait and concrete implementations:
//! - **[`DisabledRecommender`]**: always errors, so callers get the static
//!   heuristic.
//! - **[`OpenAiRecommender`]**: asks the OpenAI chat completions API for a
//!   JSON list of field names.
//!
//! [`recommend_with_timeout`] never fails: a timeout, a provider error, or
//! an answer with no usable names all degrade to
//! [`static_recommendations`]. The result is non-empty whenever the catalog
//! is.
//!
//! [`RecommendationSlot`] runs the call on a background task and exposes
//! the result through a `watch` channel, so the batch pipeline never waits
//! on it. Finished recommendations are also persisted in the property
//! store under [`RECOMMENDATION_KEY`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use field_cache_core::selection::static_recommendations;
use field_cache_core::store::PropertyStore;

use crate::config::RecommendConfig;

/// Property key holding the last finished [`Recommendation`].
pub const RECOMMENDATION_KEY: &str = "recommendation";

/// External suggestion function: catalog and current selection in,
/// suggested names out.
#[async_trait]
pub trait Recommender: Send + Sync {
    fn name(&self) -> &str;

    async fn suggest(&self, catalog: &[String], current: &[String]) -> Result<Vec<String>>;
}

/// Used when `recommend.provider = "disabled"`.
pub struct DisabledRecommender;

#[async_trait]
impl Recommender for DisabledRecommender {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn suggest(&self, _catalog: &[String], _current: &[String]) -> Result<Vec<String>> {
        bail!("recommendation provider is disabled")
    }
}

/// Recommender backed by `POST /v1/chat/completions`.
///
/// Requires `OPENAI_API_KEY`. The request timeout is enforced by
/// [`recommend_with_timeout`], not by the HTTP client.
pub struct OpenAiRecommender {
    model: String,
    max_fields: usize,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiRecommender {
    pub fn new(config: &RecommendConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("recommend.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
            max_fields: config.max_fields,
            api_key,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Recommender for OpenAiRecommender {
    fn name(&self) -> &str {
        &self.model
    }

    async fn suggest(&self, catalog: &[String], current: &[String]) -> Result<Vec<String>> {
        let prompt = format!(
            "Available fields:\n{}\n\nAlready selected:\n{}\n\n\
             Suggest up to {} additional fields most useful for grouping cases \
             into learning pathways. Reply with JSON: {{\"fields\": [\"...\"]}} \
             using names from the available list only.",
            catalog.join("\n"),
            current.join("\n"),
            self.max_fields
        );
        let body = serde_json::json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }
        let json: serde_json::Value = response.json().await?;
        parse_openai_response(&json)
    }
}

/// Extract `fields` from the JSON object in `choices[0].message.content`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<String>> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))?;
    let parsed: serde_json::Value =
        serde_json::from_str(content).context("Invalid OpenAI response: content is not JSON")?;
    let fields = parsed
        .get("fields")
        .and_then(|f| f.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing fields array"))?;
    Ok(fields
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect())
}

/// Create the [`Recommender`] named by the configuration.
pub fn create_recommender(config: &RecommendConfig) -> Result<Arc<dyn Recommender>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledRecommender)),
        "openai" => Ok(Arc::new(OpenAiRecommender::new(config)?)),
        other => bail!("Unknown recommend provider: {}", other),
    }
}

/// Where a recommendation came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecommendationSource {
    Provider { name: String },
    Fallback { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub fields: Vec<String>,
    pub source: RecommendationSource,
    pub generated_at: DateTime<Utc>,
}

impl Recommendation {
    pub fn is_fallback(&self) -> bool {
        matches!(self.source, RecommendationSource::Fallback { .. })
    }
}

/// Call `recommender` with a bounded timeout, falling back to the static
/// heuristic on timeout, error, or an answer with no catalog names.
pub async fn recommend_with_timeout(
    recommender: &dyn Recommender,
    catalog: &[String],
    current: &[String],
    timeout: Duration,
    max_fields: usize,
) -> Recommendation {
    let fallback = |reason: String| {
        warn!(reason = %reason, "using static field recommendations");
        Recommendation {
            fields: static_recommendations(catalog, current, max_fields),
            source: RecommendationSource::Fallback { reason },
            generated_at: Utc::now(),
        }
    };

    match tokio::time::timeout(timeout, recommender.suggest(catalog, current)).await {
        Ok(Ok(suggested)) => {
            let known: HashSet<&str> = catalog.iter().map(String::as_str).collect();
            let mut seen = HashSet::new();
            let fields: Vec<String> = suggested
                .into_iter()
                .filter(|name| known.contains(name.as_str()) && seen.insert(name.clone()))
                .take(max_fields.max(1))
                .collect();
            if fields.is_empty() {
                return fallback("provider returned no catalog fields".to_string());
            }
            info!(provider = recommender.name(), fields = fields.len(), "recommendation ready");
            Recommendation {
                fields,
                source: RecommendationSource::Provider {
                    name: recommender.name().to_string(),
                },
                generated_at: Utc::now(),
            }
        }
        Ok(Err(e)) => fallback(format!("{:#}", e)),
        Err(_) => fallback(format!("timed out after {}s", timeout.as_secs_f32())),
    }
}

/// Last persisted recommendation, if any.
pub async fn load_recommendation(props: &dyn PropertyStore) -> Result<Option<Recommendation>> {
    match props.get(RECOMMENDATION_KEY).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json).with_context(|| {
            format!("Corrupt recommendation in '{}'", RECOMMENDATION_KEY)
        })?)),
        None => Ok(None),
    }
}

/// Result of polling a [`RecommendationSlot`].
#[derive(Debug, Clone, PartialEq)]
pub enum SlotState {
    NotReady,
    Ready(Recommendation),
}

/// A recommendation running in the background.
pub struct RecommendationSlot {
    rx: watch::Receiver<Option<Recommendation>>,
    task: tokio::task::JoinHandle<()>,
}

impl RecommendationSlot {
    /// Start the recommendation on a background task.
    pub fn spawn(
        recommender: Arc<dyn Recommender>,
        props: Arc<dyn PropertyStore>,
        catalog: Vec<String>,
        current: Vec<String>,
        timeout: Duration,
        max_fields: usize,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(async move {
            let rec = recommend_with_timeout(
                recommender.as_ref(),
                &catalog,
                &current,
                timeout,
                max_fields,
            )
            .await;
            match serde_json::to_string(&rec) {
                Ok(json) => {
                    if let Err(e) = props.set(RECOMMENDATION_KEY, &json).await {
                        warn!(error = %e, "failed to persist recommendation");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode recommendation"),
            }
            let _ = tx.send(Some(rec));
        });
        Self { rx, task }
    }

    /// Non-blocking check. `NotReady` is a normal state.
    pub fn poll(&self) -> SlotState {
        match self.rx.borrow().as_ref() {
            Some(rec) => SlotState::Ready(rec.clone()),
            None => SlotState::NotReady,
        }
    }

    /// Wait for the result. Bounded by the recommender timeout.
    pub async fn wait(mut self) -> Result<Recommendation> {
        let rec = self
            .rx
            .wait_for(Option::is_some)
            .await
            .context("recommendation task ended without a result")?
            .clone();
        self.task.await.context("recommendation task panicked")?;
        rec.ok_or_else(|| anyhow::anyhow!("recommendation task ended without a result"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use field_cache_core::store::memory::InMemoryPropertyStore;

    struct Fixed(Vec<String>);

    #[async_trait]
    impl Recommender for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn suggest(&self, _: &[String], _: &[String]) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    struct Slow;

    #[async_trait]
    impl Recommender for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn suggest(&self, _: &[String], _: &[String]) -> Result<Vec<String>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec!["Case_Organization_Case_ID".to_string()])
        }
    }

    fn catalog() -> Vec<String> {
        vec![
            "Case_Organization_Case_ID".to_string(),
            "Case_Organization_Spark_Title".to_string(),
            "Patient_Demographics_and_Clinical_Data_Age".to_string(),
        ]
    }

    #[tokio::test]
    async fn test_provider_output_is_filtered_to_catalog() {
        let rec = recommend_with_timeout(
            &Fixed(vec![
                "Nope".to_string(),
                "Case_Organization_Spark_Title".to_string(),
                "Case_Organization_Spark_Title".to_string(),
            ]),
            &catalog(),
            &[],
            Duration::from_secs(1),
            12,
        )
        .await;
        assert_eq!(rec.fields, vec!["Case_Organization_Spark_Title".to_string()]);
        assert!(!rec.is_fallback());
    }

    #[tokio::test]
    async fn test_timeout_matches_static_heuristic() {
        let current = vec!["Case_Organization_Case_ID".to_string()];
        let rec = recommend_with_timeout(
            &Slow,
            &catalog(),
            &current,
            Duration::from_millis(20),
            12,
        )
        .await;
        assert!(rec.is_fallback());
        assert!(!rec.fields.is_empty());
        assert_eq!(rec.fields, static_recommendations(&catalog(), &current, 12));
    }

    #[tokio::test]
    async fn test_disabled_and_useless_answers_fall_back() {
        let rec =
            recommend_with_timeout(&DisabledRecommender, &catalog(), &[], Duration::from_secs(1), 12)
                .await;
        assert!(rec.is_fallback());

        let rec = recommend_with_timeout(
            &Fixed(vec!["Unknown".to_string()]),
            &catalog(),
            &[],
            Duration::from_secs(1),
            12,
        )
        .await;
        assert!(rec.is_fallback());
        assert!(!rec.fields.is_empty());
    }

    #[tokio::test]
    async fn test_slot_is_not_ready_then_ready_and_persisted() {
        let props = Arc::new(InMemoryPropertyStore::new());
        let slot = RecommendationSlot::spawn(
            Arc::new(Slow),
            props.clone(),
            catalog(),
            vec![],
            Duration::from_millis(50),
            12,
        );
        assert_eq!(slot.poll(), SlotState::NotReady);

        let rec = slot.wait().await.unwrap();
        assert!(rec.is_fallback());
        let stored = load_recommendation(props.as_ref()).await.unwrap().unwrap();
        assert_eq!(stored, rec);
    }

    #[test]
    fn test_parse_openai_response() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "{\"fields\": [\"A\", \"B\"]}" } }]
        });
        assert_eq!(parse_openai_response(&json).unwrap(), vec!["A", "B"]);
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }
}

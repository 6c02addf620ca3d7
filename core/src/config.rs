use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Quota ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Daily simulation limit per subscription tier.
    pub tiers: HashMap<String, u32>,
    /// Limit applied to tiers missing from the table.
    pub default_limit: u32,
    /// Tier assigned to guest sessions and newly seen users.
    pub guest_tier: String,
    #[serde(default = "default_user_tier")]
    pub default_user_tier: String,
}

fn default_user_tier() -> String {
    "free".into()
}

impl QuotaConfig {
    pub fn limit_for(&self, tier: &str) -> u32 {
        self.tiers.get(tier).copied().unwrap_or(self.default_limit)
    }
}

// ── Workflow engine ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub endpoint: String,
    pub callback_url: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Transport-level attempts, including the first one.
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
    /// Sent verbatim as `processingOptions` (quality level, feature flags).
    pub processing_options: serde_json::Value,
    /// Steps reported in the initial progress record before the engine
    /// sends its first callback.
    #[serde(default)]
    pub initial_steps: Vec<String>,
}

// ── Webhook ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Shared HMAC secret. None runs the reconciler in open mode,
    /// which is only meant for local development.
    pub secret: Option<String>,
    pub signature_header: String,
}

// ── Contact CTA ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactConfig {
    pub whatsapp_number: String,
    /// `{product}` is replaced by the product name from the result.
    pub message_template: String,
    pub fallback_product_name: String,
}

// ── Brief validation ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub required_fields: Vec<String>,
    pub max_input_bytes: usize,
}

// ── Root ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub quota: QuotaConfig,
    pub workflow: WorkflowConfig,
    pub webhook: WebhookConfig,
    pub contact: ContactConfig,
    pub validation: ValidationConfig,
    /// Records still processing after this long are failed by the sweep.
    pub processing_timeout_secs: i64,
}

impl LifecycleConfig {
    /// Load from the data/ directory.
    /// In tests, use LifecycleConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/lifecycle.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: LifecycleConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.workflow.max_attempts == 0 {
            anyhow::bail!("workflow.max_attempts must be at least 1");
        }
        if self.processing_timeout_secs <= 0 {
            anyhow::bail!("processing_timeout_secs must be positive");
        }
        if let Some(secret) = &self.webhook.secret {
            if secret.is_empty() {
                anyhow::bail!("webhook.secret must be omitted rather than empty");
            }
        }
        Ok(())
    }

    /// Minimal config for tests: no network backoff, open webhooks.
    pub fn default_test() -> Self {
        Self {
            quota: QuotaConfig {
                tiers: HashMap::from([
                    ("guest".to_string(), 1),
                    ("free".to_string(), 3),
                    ("basic".to_string(), 10),
                    ("pro".to_string(), 50),
                    ("enterprise".to_string(), 500),
                ]),
                default_limit: 3,
                guest_tier: "guest".into(),
                default_user_tier: "free".into(),
            },
            workflow: WorkflowConfig {
                endpoint: "http://127.0.0.1:5678/webhook/formulation".into(),
                callback_url: "http://127.0.0.1:8000/api/webhooks/simulation".into(),
                timeout_secs: 5,
                connect_timeout_secs: 1,
                max_attempts: 1,
                retry_backoff_secs: 0,
                processing_options: serde_json::json!({
                    "quality_level": "high",
                    "include_market_analysis": true,
                    "include_regulatory_check": true
                }),
                initial_steps: vec![
                    "ingredient_analysis".into(),
                    "market_research".into(),
                    "report_generation".into(),
                ],
            },
            webhook: WebhookConfig {
                secret: None,
                signature_header: "X-Signature".into(),
            },
            contact: ContactConfig {
                whatsapp_number: "6281234567890".into(),
                message_template: "Hi, I would like to discuss the {product} formulation.".into(),
                fallback_product_name: "skincare product".into(),
            },
            validation: ValidationConfig {
                required_fields: vec!["product_type".into()],
                max_input_bytes: 64 * 1024,
            },
            processing_timeout_secs: 30 * 60,
        }
    }
}

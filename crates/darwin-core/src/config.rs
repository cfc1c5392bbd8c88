use std::env;

/// Application configuration loaded from environment variables (spec §6.5).
#[derive(Debug, Clone)]
pub struct Config {
    // Store
    pub store_url: String,

    // Embedding
    pub embedding_dim: usize,
    pub embedding_provider: String,

    // LLM
    pub llm_provider: String,
    pub llm_model: String,
    pub anthropic_api_key: String,

    // Clustering thresholds
    pub cluster_threshold_high: f32,
    pub cluster_threshold_low: f32,

    // Classification
    pub classify_confidence_min: f32,

    // Fix iteration
    pub fix_auto_iter_max: u32,

    // Webhooks
    pub webhook_secret: String,

    // product -> forge repo identifier, "product1=org/repo1,product2=org/repo2"
    pub product_repos: Vec<(String, String)>,

    // Worker tuning (§4, §5)
    pub poll_timeout_secs: u64,
    pub embed_retry_max: u32,
    pub drain_timeout_secs: u64,
    pub queue_backpressure_threshold: u64,

    // HTTP server
    pub web_host: String,
    pub web_port: u16,
}

impl Config {
    /// Load full configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            store_url: required_env("STORE_URL"),
            embedding_dim: env::var("EMBEDDING_DIM")
                .unwrap_or_else(|_| "384".to_string())
                .parse()
                .expect("EMBEDDING_DIM must be a number"),
            embedding_provider: env::var("EMBEDDING_PROVIDER")
                .unwrap_or_else(|_| "local".to_string()),
            llm_provider: env::var("LLM_PROVIDER").unwrap_or_else(|_| "anthropic".to_string()),
            llm_model: env::var("LLM_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-5-20250929".to_string()),
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            cluster_threshold_high: parse_env_or("CLUSTER_THRESHOLD_HIGH", 0.75),
            cluster_threshold_low: parse_env_or("CLUSTER_THRESHOLD_LOW", 0.60),
            classify_confidence_min: parse_env_or("CLASSIFY_CONFIDENCE_MIN", 0.5),
            fix_auto_iter_max: parse_env_or("FIX_AUTO_ITER_MAX", 3),
            webhook_secret: env::var("WEBHOOK_SECRET").unwrap_or_default(),
            product_repos: parse_product_repos(&env::var("PRODUCT_REPOS").unwrap_or_default()),
            poll_timeout_secs: parse_env_or("POLL_TIMEOUT_SECS", 1),
            embed_retry_max: parse_env_or("EMBED_RETRY_MAX", 5),
            drain_timeout_secs: parse_env_or("DRAIN_TIMEOUT_SECS", 30),
            queue_backpressure_threshold: parse_env_or("QUEUE_BACKPRESSURE_THRESHOLD", 10_000),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: env::var("WEB_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .expect("WEB_PORT must be a number"),
        }
    }

    /// Log presence and length of sensitive values, never the values themselves.
    pub fn log_redacted(&self) {
        let vars = [
            ("STORE_URL", &self.store_url),
            ("ANTHROPIC_API_KEY", &self.anthropic_api_key),
            ("WEBHOOK_SECRET", &self.webhook_secret),
        ];
        for (name, value) in vars {
            if value.is_empty() {
                tracing::info!("{name} = (empty)");
            } else {
                tracing::info!("{name} = ({} chars)", value.len());
            }
        }
    }

    /// Look up the forge repo identifier for a product.
    pub fn repo_for_product(&self, product: &str) -> Option<&str> {
        self.product_repos
            .iter()
            .find(|(p, _)| p == product)
            .map(|(_, r)| r.as_str())
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_product_repos(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (p, r) = pair.split_once('=')?;
            Some((p.trim().to_string(), r.trim().to_string()))
        })
        .collect()
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_product_repos() {
        let parsed = parse_product_repos("joplin=org/joplin, other=org/other");
        assert_eq!(
            parsed,
            vec![
                ("joplin".to_string(), "org/joplin".to_string()),
                ("other".to_string(), "org/other".to_string()),
            ]
        );
    }

    #[test]
    fn parses_empty_product_repos() {
        assert!(parse_product_repos("").is_empty());
    }
}

use anyhow::Result;
use serde::Deserialize;

use crate::audio::{GateConfig, NormalizerConfig};
use crate::filter::FilterConfig;
use crate::limiter::LimiterConfig;
use crate::metrics::MetricsConfig;
use crate::session::SessionConfig;
use crate::stt::{BreakerConfig, RetryConfig};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub nats: NatsConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    /// Request/reply subject of the speech-to-text service.
    #[serde(default = "default_stt_subject")]
    pub stt_subject: String,
    #[serde(default = "default_stt_timeout_ms")]
    pub stt_timeout_ms: u64,
}

fn default_stt_subject() -> String {
    "stt.transcribe".to_string()
}

fn default_stt_timeout_ms() -> u64 {
    15_000
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "streamscribe".to_string(),
                http: HttpConfig {
                    bind: "127.0.0.1".to_string(),
                    port: 8090,
                },
            },
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                stt_subject: default_stt_subject(),
                stt_timeout_ms: default_stt_timeout_ms(),
            },
            normalizer: NormalizerConfig::default(),
            gate: GateConfig::default(),
            limiter: LimiterConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            filter: FilterConfig::default(),
            session: SessionConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

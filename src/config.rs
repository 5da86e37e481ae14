//! Configuração do postqueue carregada a partir de `postqueue.toml`.
//!
//! A struct [`Config`] agrupa as seções `[graph]`, `[http_retry]`,
//! `[job_retry]`, `[polling]`, `[scheduler]` e `[store]`. Valores não
//! presentes no arquivo usam defaults sensíveis. As variáveis de ambiente
//! `IG_USER_ID`, `IG_ACCESS_TOKEN` e `POSTQUEUE_DB` têm precedência sobre o
//! arquivo.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::{Backoff, RetryPolicy};
use crate::error::PostqueueError;
use crate::queue::QueuePolicy;

/// Caminho padrão do arquivo de configuração.
pub const DEFAULT_CONFIG_PATH: &str = "postqueue.toml";

/// Configuração de nível superior.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub http_retry: HttpRetryConfig,
    #[serde(default)]
    pub job_retry: JobRetryConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Conexão com a Graph API.
#[derive(Clone, Deserialize)]
pub struct GraphConfig {
    /// Raiz da API, sem versão.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Versão da API (ex.: "v18.0").
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// ID da conta profissional do Instagram.
    #[serde(default)]
    pub user_id: String,

    /// Token de acesso. Nunca aparece em logs nem em `Debug`.
    #[serde(default)]
    pub access_token: String,

    /// Tamanho máximo da legenda, em caracteres.
    #[serde(default = "default_caption_limit")]
    pub caption_limit: usize,

    /// Timeout de cada requisição HTTP, em segundos.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_api_version() -> String {
    "v18.0".to_string()
}

fn default_caption_limit() -> usize {
    2200
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_version: default_api_version(),
            user_id: String::new(),
            access_token: String::new(),
            caption_limit: default_caption_limit(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl fmt::Debug for GraphConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = if self.access_token.is_empty() {
            "<unset>"
        } else {
            "<redacted>"
        };
        f.debug_struct("GraphConfig")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("user_id", &self.user_id)
            .field("access_token", &token)
            .field("caption_limit", &self.caption_limit)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl GraphConfig {
    /// URL base versionada, ex.: `https://graph.facebook.com/v18.0`.
    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.api_version.trim_matches('/')
        )
    }
}

/// Retentativas de chamadas HTTP com erro transitório.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpRetryConfig {
    #[serde(default = "default_http_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_http_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_http_max_retries")]
    pub max_retries: u32,
}

fn default_http_base_delay_ms() -> u64 {
    300
}

fn default_http_max_delay_ms() -> u64 {
    5000
}

fn default_http_max_retries() -> u32 {
    2
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_http_base_delay_ms(),
            max_delay_ms: default_http_max_delay_ms(),
            max_retries: default_http_max_retries(),
        }
    }
}

impl HttpRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: Backoff::new(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            ),
            max_retries: self.max_retries,
        }
    }
}

/// Reagendamento de jobs que falharam.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRetryConfig {
    #[serde(default = "default_job_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_job_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Ausente = retentar para sempre.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_job_base_delay_secs() -> u64 {
    30
}

fn default_job_max_delay_secs() -> u64 {
    15 * 60
}

impl Default for JobRetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_job_base_delay_secs(),
            max_delay_secs: default_job_max_delay_secs(),
            max_attempts: None,
        }
    }
}

/// Polling do status do container.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

fn default_max_polls() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    3000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            max_polls: default_max_polls(),
            interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Execução dos ticks.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Máximo de jobs reivindicados por tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Jobs publicados em paralelo dentro de um tick. 1 preserva a ordem.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Intervalo entre ticks no modo `serve`.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Tempo após o qual um job preso em `publishing` volta para a fila.
    /// Precisa ser maior que a publicação mais longa possível.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

fn default_batch_size() -> usize {
    10
}

fn default_concurrency() -> usize {
    1
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_lease_secs() -> u64 {
    30 * 60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            tick_interval_secs: default_tick_interval_secs(),
            lease_secs: default_lease_secs(),
        }
    }
}

/// Persistência dos jobs.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Arquivo SQLite.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Dias até um job concluído poder ser apagado. 0 = manter para sempre.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("postqueue.db")
}

fn default_retention_days() -> u32 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            retention_days: default_retention_days(),
        }
    }
}

impl Config {
    /// Carrega a configuração de `path`. Usa valores padrão se o arquivo não
    /// existir, aplica as variáveis de ambiente e valida o resultado.
    pub fn load(path: &Path) -> Result<Self, PostqueueError> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, PostqueueError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str::<Config>(&contents)?)
    }

    /// Sobrescreve campos com variáveis de ambiente não vazias.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        if let Some(user_id) = non_empty("IG_USER_ID") {
            self.graph.user_id = user_id;
        }
        if let Some(token) = non_empty("IG_ACCESS_TOKEN") {
            self.graph.access_token = token;
        }
        if let Some(path) = non_empty("POSTQUEUE_DB") {
            self.store.path = PathBuf::from(path);
        }
    }

    /// Rejeita valores que travariam o agendador.
    pub fn validate(&self) -> Result<(), PostqueueError> {
        let checks = [
            (self.scheduler.batch_size == 0, "scheduler.batch_size must be > 0"),
            (self.scheduler.concurrency == 0, "scheduler.concurrency must be > 0"),
            (self.scheduler.tick_interval_secs == 0, "scheduler.tick_interval_secs must be > 0"),
            (self.polling.max_polls == 0, "polling.max_polls must be > 0"),
            (self.graph.caption_limit == 0, "graph.caption_limit must be > 0"),
            (self.job_retry.base_delay_secs == 0, "job_retry.base_delay_secs must be > 0"),
            (self.job_retry.max_attempts == Some(0), "job_retry.max_attempts must be > 0"),
        ];
        if let Some((_, message)) = checks.iter().find(|(bad, _)| *bad) {
            return Err(PostqueueError::Config(message.to_string()));
        }

        let longest = self.longest_publish();
        if Duration::from_secs(self.scheduler.lease_secs) <= longest {
            return Err(PostqueueError::Config(format!(
                "scheduler.lease_secs must exceed the longest possible publish ({}s)",
                longest.as_secs()
            )));
        }
        Ok(())
    }

    /// Pior caso de uma publicação: cada chamada HTTP (criar, `max_polls`
    /// consultas de status, publicar) esgota timeout e retentativas, mais
    /// as esperas entre consultas.
    pub fn longest_publish(&self) -> Duration {
        let retries = self.http_retry.max_retries;
        let backoff = Duration::from_millis(self.http_retry.max_delay_ms).saturating_mul(retries);
        let per_call = Duration::from_secs(self.graph.request_timeout_secs)
            .saturating_mul(retries.saturating_add(1))
            .saturating_add(backoff);
        let calls = self.polling.max_polls.saturating_add(2);
        per_call
            .saturating_mul(calls)
            .saturating_add(self.polling.interval().saturating_mul(self.polling.max_polls))
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy {
            backoff: Backoff::new(
                Duration::from_secs(self.job_retry.base_delay_secs),
                Duration::from_secs(self.job_retry.max_delay_secs),
            ),
            max_attempts: self.job_retry.max_attempts,
            retention: (self.store.retention_days > 0)
                .then(|| chrono::Duration::try_days(i64::from(self.store.retention_days)))
                .flatten(),
        }
    }

    pub fn lease(&self) -> chrono::Duration {
        i64::try_from(self.scheduler.lease_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

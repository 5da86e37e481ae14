//! Tipos de dados das respostas da Graph API usadas na publicação.
//!
//! Só os campos que o fluxo de publicação consome são modelados; o resto do
//! JSON é ignorado pelo `serde`.

use serde::{Deserialize, Serialize};

/// Resposta com um único `id` (criação de container e `media_publish`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdResponse {
    pub id: Option<String>,
}

/// Estado de processamento de um container de mídia, conforme `status_code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    InProgress,
    /// Pronto para `media_publish`.
    Finished,
    Error,
    Expired,
    /// Já publicado por outra chamada.
    Published,
    /// Código desconhecido ou ausente; tratado como "ainda processando".
    Unknown(String),
}

impl ContainerStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "IN_PROGRESS" => ContainerStatus::InProgress,
            "FINISHED" => ContainerStatus::Finished,
            "ERROR" => ContainerStatus::Error,
            "EXPIRED" => ContainerStatus::Expired,
            "PUBLISHED" => ContainerStatus::Published,
            other => ContainerStatus::Unknown(other.to_string()),
        }
    }
}

/// Resposta de `GET /{creation-id}?fields=status_code,status`.
///
/// `status_code` é o enum curto; `status` traz o detalhe legível
/// (ex.: `"Error: Media download has failed"`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStatusResponse {
    #[serde(default)]
    pub status_code: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ContainerStatusResponse {
    pub fn code(&self) -> ContainerStatus {
        ContainerStatus::from_code(self.status_code.as_deref().unwrap_or(""))
    }

    /// Detalhe para mensagens de erro: `status` se existir, senão o código.
    pub fn detail(&self) -> String {
        self.status
            .clone()
            .or_else(|| self.status_code.clone())
            .unwrap_or_else(|| "no status reported".to_string())
    }
}

/// Perfil da conta profissional (`fields=id,username,followers_count,media_count`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub followers_count: Option<u64>,
    #[serde(default)]
    pub media_count: Option<u64>,
}

/// Envelope de erro da Graph API: `{"error": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphErrorEnvelope {
    pub error: GraphErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub error_subcode: Option<i64>,
    #[serde(default)]
    pub is_transient: bool,
    #[serde(default)]
    pub fbtrace_id: Option<String>,
}

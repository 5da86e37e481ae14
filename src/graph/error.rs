//! Tipos de erro para o cliente da Graph API.
//!
//! Define [`GraphError`] e a classificação transitório/terminal usada pela
//! política de retentativa HTTP.

use thiserror::Error;

use crate::backoff::Transient;

/// Códigos de erro da Graph API que indicam falha temporária
/// (erro interno, indisponibilidade, limites de taxa).
const TRANSIENT_CODES: [i64; 7] = [1, 2, 4, 17, 32, 341, 613];

/// Subcódigos de erro de mídia que costumam se resolver sozinhos.
const TRANSIENT_SUBCODES: [i64; 3] = [2_207_001, 2_207_003, 2_207_008];

/// Erros que podem ocorrer ao interagir com a Graph API.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A API respondeu com status de erro. Os campos vêm do corpo
    /// `{"error": {...}}` quando ele existe.
    #[error("Graph API error (status {status}): {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        subcode: Option<i64>,
        message: String,
        is_transient: bool,
    },

    /// Falha de rede subjacente (DNS, conexão recusada ou resetada, timeout).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// O corpo da resposta não é o JSON esperado.
    #[error("failed to decode Graph response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Resposta de sucesso sem um campo obrigatório.
    #[error("Graph response missing field `{0}`")]
    MissingField(&'static str),

    /// Credenciais ou identificadores ausentes na configuração.
    #[error("Graph client not configured: {0} is empty")]
    NotConfigured(&'static str),
}

impl Transient for GraphError {
    fn is_transient(&self) -> bool {
        match self {
            GraphError::Api {
                status,
                code,
                subcode,
                is_transient,
                ..
            } => {
                *is_transient
                    || *status >= 500
                    || *status == 429
                    || code.is_some_and(|c| TRANSIENT_CODES.contains(&c))
                    || subcode.is_some_and(|s| TRANSIENT_SUBCODES.contains(&s))
            }
            // Body and decode errors here are transport failures while
            // reading the response (reset or truncated), not bad JSON.
            GraphError::Network(e) => {
                e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
            }
            GraphError::Decode(_) | GraphError::MissingField(_) | GraphError::NotConfigured(_) => {
                false
            }
        }
    }
}

//! Erros do transporte HTTP de relay e sua classificação.
//!
//! Cada [`RelayError`] é mapeado para uma falha transitória (vale a pena
//! retentar) ou permanente (não adianta retentar) via
//! [`RelayError::into_outcome`].

use thiserror::Error;

use crate::dispatch::AttemptOutcome;

/// Erros que podem ocorrer ao entregar uma mensagem pelo relay HTTP.
#[derive(Debug, Error)]
pub enum RelayError {
    /// O relay retornou HTTP 429 (limite de envio).
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro HTTP retornado pelo relay (ex.: 400 destinatário inválido, 503 indisponível).
    #[error("relay error (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl RelayError {
    /// 429, 5xx e falhas de rede são transitórias; os demais 4xx
    /// (destinatário inválido, autenticação) são permanentes.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::RateLimited { .. } => true,
            RelayError::Rejected { status, .. } => *status >= 500 || *status == 408,
            RelayError::NetworkError(_) => true,
        }
    }

    pub fn into_outcome(self) -> AttemptOutcome {
        if self.is_transient() {
            AttemptOutcome::TransientFailure(self.to_string())
        } else {
            AttemptOutcome::PermanentFailure(self.to_string())
        }
    }
}

//! Configuração do groupmail carregada a partir de `groupmail.toml`.
//!
//! A struct [`GroupMailConfig`] reúne colunas, política de resolução,
//! ritmo de envio, templates e transporte. Valores ausentes no arquivo usam
//! defaults sensíveis. A variável de ambiente `GROUPMAIL_RELAY_TOKEN` tem
//! precedência sobre o token do arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::dispatch::{PacingConfig, RetryBackoff};
use crate::resolver::ResolutionPolicy;

/// Configuração de nível superior carregada de `groupmail.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupMailConfig {
    #[serde(default)]
    pub columns: ColumnsConfig,

    /// Política para grupos com mais de um e-mail.
    #[serde(default)]
    pub policy: ResolutionPolicy,

    #[serde(default)]
    pub pacing: PacingSection,

    #[serde(default)]
    pub template: TemplateSection,

    #[serde(default)]
    pub transport: TransportSection,

    /// Onde o snapshot de progresso é gravado.
    #[serde(default = "default_progress_path")]
    pub progress_path: PathBuf,
}

/// Colunas do conjunto de registros usadas pelo agrupamento.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnsConfig {
    /// Coluna-chave do agrupamento.
    #[serde(default = "default_group_key")]
    pub group_key: String,

    /// Coluna com o e-mail do destinatário.
    #[serde(default = "default_email")]
    pub email: String,

    /// Colunas numéricas somadas por grupo.
    #[serde(default)]
    pub sum: Vec<String>,

    /// Colunas exibidas na tabela da mensagem.
    #[serde(default)]
    pub display: Vec<String>,

    /// Sufixos que marcam linhas de subtotal (ex.: `" 합계"`).
    #[serde(default)]
    pub total_row_suffixes: Vec<String>,

    /// Recalcula as somas a partir das linhas comuns. Com `false`, grupos que
    /// têm linhas de subtotal usam os valores já exportados nelas.
    #[serde(default = "default_true")]
    pub recalculate_totals: bool,

    /// Tabela separada de e-mails, unida aos registros antes da resolução.
    #[serde(default)]
    pub email_lookup: Option<EmailLookupConfig>,
}

/// Arquivo JSON que associa uma chave ao e-mail do destinatário.
///
/// Chaves são comparadas como texto sem espaços nas pontas; a primeira linha
/// de cada chave vale. Registros sem correspondência mantêm o próprio e-mail.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailLookupConfig {
    pub file: PathBuf,

    /// Coluna dos registros usada na junção.
    pub data_key: String,

    /// Coluna da tabela de e-mails usada na junção.
    pub lookup_key: String,

    /// Coluna da tabela de e-mails com o endereço.
    #[serde(default = "default_email")]
    pub email: String,
}

/// Ritmo de envio e limites de retentativa.
#[derive(Debug, Clone, Deserialize)]
pub struct PacingSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_inter_job_delay_ms")]
    pub inter_job_delay_ms: u64,

    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: RetryBackoff,
}

/// Templates de assunto e corpo (placeholders `{{ nome }}`).
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSection {
    #[serde(default = "default_subject")]
    pub subject: String,

    #[serde(default = "default_body")]
    pub body: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// POST para um relay HTTP de e-mail.
    Relay,
    /// Grava as mensagens em um diretório (simulação).
    #[default]
    Outbox,
}

/// Configuração do transporte de entrega.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSection {
    #[serde(default)]
    pub kind: TransportKind,

    /// URL do relay HTTP.
    #[serde(default)]
    pub endpoint: String,

    /// Token do relay.
    #[serde(default)]
    pub api_token: String,

    /// Endereço do remetente; também recebe o envio de teste.
    #[serde(default)]
    pub sender: String,

    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,
}

// Valor padrão para a coluna-chave: "group_key".
fn default_group_key() -> String {
    "group_key".to_string()
}

// Valor padrão para a coluna de e-mail: "email".
fn default_email() -> String {
    "email".to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    10
}

fn default_inter_job_delay_ms() -> u64 {
    2000
}

fn default_inter_batch_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_subject() -> String {
    "[{{ period }}] Statement for {{ group_key }}".to_string()
}

fn default_body() -> String {
    "<p>Hello {{ group_key }},</p>\n\
     <p>Please find your statement for {{ period }} below ({{ row_count }} rows).</p>\n\
     {{ rows }}\n\
     <p>Sent on {{ date }}.</p>"
        .to_string()
}

fn default_outbox_dir() -> PathBuf {
    PathBuf::from("outbox")
}

fn default_progress_path() -> PathBuf {
    PathBuf::from(".groupmail/progress.json")
}

impl Default for GroupMailConfig {
    fn default() -> Self {
        Self {
            columns: ColumnsConfig::default(),
            policy: ResolutionPolicy::default(),
            pacing: PacingSection::default(),
            template: TemplateSection::default(),
            transport: TransportSection::default(),
            progress_path: default_progress_path(),
        }
    }
}

impl Default for ColumnsConfig {
    fn default() -> Self {
        Self {
            group_key: default_group_key(),
            email: default_email(),
            sum: Vec::new(),
            display: Vec::new(),
            total_row_suffixes: Vec::new(),
            recalculate_totals: true,
            email_lookup: None,
        }
    }
}

impl Default for PacingSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            inter_job_delay_ms: default_inter_job_delay_ms(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            max_attempts: default_max_attempts(),
            backoff: RetryBackoff::default(),
        }
    }
}

impl Default for TemplateSection {
    fn default() -> Self {
        Self {
            subject: default_subject(),
            body: default_body(),
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            endpoint: String::new(),
            api_token: String::new(),
            sender: String::new(),
            outbox_dir: default_outbox_dir(),
        }
    }
}

impl PacingSection {
    /// Converte para a configuração usada pelo scheduler.
    pub fn to_pacing(&self) -> PacingConfig {
        PacingConfig {
            batch_size: self.batch_size,
            inter_job_delay: Duration::from_millis(self.inter_job_delay_ms),
            inter_batch_delay: Duration::from_millis(self.inter_batch_delay_ms),
            max_attempts_per_job: self.max_attempts,
            retry_backoff: self.backoff.clone(),
        }
    }
}

impl GroupMailConfig {
    /// Carrega a configuração de `path`.
    /// Usa valores padrão se o arquivo não existir. O ritmo só é validado
    /// pelo scheduler, depois que as flags da CLI foram aplicadas.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<GroupMailConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para o token do relay.
        if let Ok(token) = std::env::var("GROUPMAIL_RELAY_TOKEN")
            && !token.is_empty()
        {
            config.transport.api_token = token;
        }

        Ok(config)
    }
}

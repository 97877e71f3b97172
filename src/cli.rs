//! Interface de linha de comando do groupmail baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (plan, run, status,
//! clear, cancel, test-send) e flags globais (--config, --policy, --batch-size,
//! --max-attempts, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::resolver::ResolutionPolicy;

/// groupmail: envio agrupado de e-mails com retomada e ritmo controlado.
#[derive(Debug, Parser)]
#[command(name = "groupmail", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = "groupmail.toml")]
    pub config: PathBuf,

    /// Política para grupos com e-mails conflitantes (sobrescreve o arquivo).
    #[arg(long, global = true)]
    pub policy: Option<PolicyArg>,

    /// Número de jobs por lote (sobrescreve o arquivo).
    #[arg(long, global = true)]
    pub batch_size: Option<usize>,

    /// Número máximo de tentativas por job (sobrescreve o arquivo).
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Política aceita pela CLI, mapeada para [`ResolutionPolicy`].
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    /// Usa o primeiro e-mail encontrado no grupo.
    FirstSeen,
    /// Usa o e-mail mais frequente; empate vai para o primeiro visto.
    MostFrequent,
    /// Não envia grupos com conflito.
    SkipOnConflict,
}

impl From<PolicyArg> for ResolutionPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::FirstSeen => ResolutionPolicy::FirstSeen,
            PolicyArg::MostFrequent => ResolutionPolicy::MostFrequent,
            PolicyArg::SkipOnConflict => ResolutionPolicy::SkipOnConflict,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Agrupa, resolve destinatários e mostra o plano sem enviar nada.
    Plan {
        /// Arquivo JSON com os registros (array de objetos).
        #[arg(long, short)]
        input: PathBuf,
    },

    /// Envia os jobs, retomando o progresso salvo quando houver.
    Run {
        /// Arquivo JSON com os registros (array de objetos).
        #[arg(long, short)]
        input: PathBuf,

        /// Descarta o progresso salvo e começa do início.
        #[arg(long, default_value_t = false)]
        restart: bool,

        /// Grava o relatório final em JSON neste caminho.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Mostra o progresso salvo.
    Status,

    /// Remove o progresso salvo.
    Clear,

    /// Cancela um envio pausado; o progresso salvo passa a ABORTED.
    Cancel {
        /// Arquivo JSON com os registros (array de objetos).
        #[arg(long, short)]
        input: PathBuf,
    },

    /// Envia o primeiro job ao remetente configurado com assunto "[TEST]".
    TestSend {
        /// Arquivo JSON com os registros (array de objetos).
        #[arg(long, short)]
        input: PathBuf,
    },
}

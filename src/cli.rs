//! Interface de linha de comando do postqueue baseada em clap.
//!
//! Define a struct [`Cli`] com os subcomandos [`Command`] (enqueue, tick,
//! serve, status, publish, profile, purge) e as flags globais
//! (--config, --verbose, --log-json).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::DEFAULT_CONFIG_PATH;
use crate::queue::JobStatus;

/// postqueue: agenda publicações de imagens no Instagram e as publica na hora certa.
#[derive(Debug, Parser)]
#[command(name = "postqueue", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Logs em JSON (também via LOG_JSON=true).
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,
}

/// Filtro de status aceito pela CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Queued,
    Publishing,
    Done,
    Failed,
}

impl From<StatusArg> for JobStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Queued => JobStatus::Queued,
            StatusArg::Publishing => JobStatus::Publishing,
            StatusArg::Done => JobStatus::Done,
            StatusArg::Failed => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Agenda uma publicação. Repetir o mesmo pedido não cria um segundo job.
    Enqueue {
        /// URL pública da imagem.
        #[arg(long)]
        image_url: String,

        /// Legenda do post.
        #[arg(long)]
        caption: String,

        /// Horário de publicação em RFC 3339 (ex.: 2025-07-24T23:06:00Z).
        #[arg(long)]
        publish_at: String,
    },

    /// Executa um tick: publica os jobs vencidos.
    Tick,

    /// Executa ticks periódicos até Ctrl-C.
    Serve {
        /// Intervalo entre ticks, em segundos (padrão: scheduler.tick_interval_secs).
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Mostra contagens por status e lista jobs.
    Status {
        /// Lista apenas jobs neste status.
        #[arg(long)]
        status: Option<StatusArg>,

        /// Máximo de jobs listados.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Publica imediatamente, sem passar pela fila.
    Publish {
        #[arg(long)]
        image_url: String,

        #[arg(long)]
        caption: String,
    },

    /// Consulta o perfil da conta (teste de credenciais).
    Profile,

    /// Apaga jobs concluídos cujo prazo de retenção passou.
    Purge,
}

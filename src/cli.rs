//! Interface de linha de comando do convoy baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, config)
//! e flags globais (--config, --max-concurrency, --verbose, --log-json).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// convoy: orquestrador concorrente de tarefas com recursos em pool.
#[derive(Debug, Parser)]
#[command(name = "convoy", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./convoy.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Teto da concorrência, sobrepondo o arquivo e o ambiente.
    #[arg(long, global = true)]
    pub max_concurrency: Option<usize>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emite logs em JSON no stderr.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa uma rodada contra colaboradores simulados.
    Demo {
        /// Número de sucessos desejados.
        #[arg(long, default_value_t = 5)]
        successes: u32,

        /// Faz falhar a etapa de identidade a cada K tarefas.
        #[arg(long)]
        fail_every: Option<u64>,

        /// URL alvo repassada ao driver.
        #[arg(long, default_value = "https://example.test/signup")]
        target: String,
    },

    /// Mostra a configuração efetiva em JSON.
    Config,
}

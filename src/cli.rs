//! Interface de linha de comando do cutflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, once, stage,
//! status, events) e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::state_machine::JobStatus;

/// cutflow: rastreamento de jobs de corte do programa à paletização.
#[derive(Debug, Parser)]
#[command(name = "cutflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `cutflow.toml`).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inicia todos os loops de varredura até Ctrl-C.
    Run,

    /// Executa um único ciclo em cada raiz e mostra o resumo.
    Once,

    /// Copia os arquivos do job para a pasta da máquina e marca como STAGED.
    Stage {
        /// Chave do job (`pasta/base`).
        key: String,

        /// Id da máquina de destino.
        #[arg(long, short)]
        machine: u32,
    },

    /// Lista os jobs, opcionalmente filtrando por status.
    Status {
        /// Mostra apenas jobs neste status (ex.: `CNC_FINISH`).
        #[arg(long, short)]
        status: Option<JobStatus>,
    },

    /// Mostra o histórico de eventos de um job em JSON.
    Events {
        /// Chave do job (`pasta/base`).
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_stage_subcommand() {
        let cli = Cli::parse_from(["cutflow", "stage", "a/part1", "--machine", "2"]);
        match cli.command {
            Command::Stage { key, machine } => {
                assert_eq!(key, "a/part1");
                assert_eq!(machine, 2);
            }
            _ => panic!("expected Stage command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["cutflow", "--config", "/etc/cutflow.toml", "--verbose", "once"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/cutflow.toml")));
        assert!(matches!(cli.command, Command::Once));
    }

    #[test]
    fn cli_parses_status_filter() {
        let cli = Cli::parse_from(["cutflow", "status", "--status", "CNC_FINISH"]);
        match cli.command {
            Command::Status { status } => assert_eq!(status, Some(JobStatus::CncFinish)),
            _ => panic!("expected Status command"),
        }
        assert!(Cli::try_parse_from(["cutflow", "status", "--status", "bogus"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}

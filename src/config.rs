//! Configuração do cutflow carregada a partir de `cutflow.toml`.
//!
//! A struct [`EngineConfig`] contém todas as pastas observadas, os tempos de
//! varredura e a lista de máquinas. Valores ausentes no arquivo usam defaults.
//! A variável de ambiente `CUTFLOW_DATA_DIR` tem precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::handoff::MailboxOptions;
use crate::state_machine::Machine;

pub const DEFAULT_CONFIG_FILE: &str = "cutflow.toml";

/// Configuração de nível superior carregada de `cutflow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Diretório com `jobs.json`, `events.jsonl` e o log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Raiz de entrada com os programas `.nc` processados.
    #[serde(default)]
    pub processed_jobs_root: Option<PathBuf>,

    /// Pasta global onde chegam os arquivos de status.
    #[serde(default)]
    pub status_root: Option<PathBuf>,

    /// Intervalo entre ciclos de varredura, por raiz.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Tempo que tamanho e mtime precisam ficar estáveis antes da leitura.
    #[serde(default = "default_stable_window_ms")]
    pub stable_window_ms: u64,

    /// Janela em que um arquivo já processado é reprocessado mesmo sem mudança.
    #[serde(default = "default_force_window_ms")]
    pub force_window_ms: u64,

    /// Move arquivos consumidos para a subpasta de arquivo.
    #[serde(default = "default_true")]
    pub archive_consumed: bool,

    #[serde(default = "default_archive_dir_name")]
    pub archive_dir_name: String,

    /// Quantidade de posições de palete por máquina.
    #[serde(default = "default_pallet_slots")]
    pub pallet_slots: u32,

    #[serde(default)]
    pub handoff: HandoffConfig,

    #[serde(default)]
    pub machines: Vec<Machine>,
}

/// Parâmetros da caixa de correio de entrega (`[handoff]`).
#[derive(Debug, Clone, Deserialize)]
pub struct HandoffConfig {
    #[serde(default = "default_mailbox_name")]
    pub mailbox_name: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Valor constante escrito na coluna `Destination`.
    #[serde(default = "default_destination")]
    pub destination: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("cutflow-data")
}

fn default_scan_interval_ms() -> u64 {
    2000
}

fn default_stable_window_ms() -> u64 {
    3000
}

fn default_force_window_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_archive_dir_name() -> String {
    "archive".to_string()
}

fn default_pallet_slots() -> u32 {
    20
}

fn default_mailbox_name() -> String {
    "Nestpick.csv".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_destination() -> String {
    "99".to_string()
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            mailbox_name: default_mailbox_name(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: default_timeout_ms(),
            destination: default_destination(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            processed_jobs_root: None,
            status_root: None,
            scan_interval_ms: default_scan_interval_ms(),
            stable_window_ms: default_stable_window_ms(),
            force_window_ms: default_force_window_ms(),
            archive_consumed: true,
            archive_dir_name: default_archive_dir_name(),
            pallet_slots: default_pallet_slots(),
            handoff: HandoffConfig::default(),
            machines: Vec::new(),
        }
    }
}

impl HandoffConfig {
    pub fn mailbox_options(&self) -> MailboxOptions {
        MailboxOptions {
            mailbox_name: self.mailbox_name.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            destination: self.destination.clone(),
        }
    }
}

impl EngineConfig {
    /// Carrega a configuração de `path`, ou de `cutflow.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<EngineConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(dir) = std::env::var("CUTFLOW_DATA_DIR")
            && !dir.is_empty()
        {
            config.data_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita ids de máquina duplicados e janelas inválidas.
    pub fn validate(&self) -> Result<()> {
        let mut ids: Vec<u32> = self.machines.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        if let Some(w) = ids.windows(2).find(|w| w[0] == w[1]) {
            anyhow::bail!("machine id {} is configured more than once", w[0]);
        }
        if self.scan_interval_ms == 0 {
            anyhow::bail!("scan_interval_ms must be greater than zero");
        }
        if self.pallet_slots == 0 {
            anyhow::bail!("pallet_slots must be greater than zero");
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn stable_window(&self) -> Duration {
        Duration::from_millis(self.stable_window_ms)
    }

    pub fn force_window(&self) -> Duration {
        Duration::from_millis(self.force_window_ms)
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.data_dir.join("events.jsonl")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("cutflow.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.stable_window_ms, 3000);
        assert_eq!(config.force_window_ms, 10_000);
        assert_eq!(config.handoff.mailbox_name, "Nestpick.csv");
        assert_eq!(config.handoff.timeout_ms, 300_000);
        assert_eq!(config.handoff.poll_interval_ms, 1000);
        assert!(config.archive_consumed);
        assert!(config.machines.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            status_root = "/shop/autopac"
            scan_interval_ms = 500

            [handoff]
            destination = "42"

            [[machines]]
            id = 1
            name = "WT1"
            address = "10.0.0.11"
            run_folder = "/shop/wt1/ready"
            handoff_folder = "/shop/wt1/nestpick"
            handoff_enabled = true

            [[machines]]
            id = 2
            name = "WT2"
            run_folder = "/shop/wt2/ready"
            status_folder = "/shop/wt2/status"
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.status_root, Some(PathBuf::from("/shop/autopac")));
        assert_eq!(config.scan_interval(), Duration::from_millis(500));
        assert_eq!(config.handoff.destination, "42");
        assert_eq!(config.handoff.mailbox_name, "Nestpick.csv");
        assert_eq!(config.machines.len(), 2);
        assert!(config.machines[0].handoff_enabled);
        assert!(!config.machines[1].handoff_enabled);
        assert_eq!(
            config.machines[1].status_folder,
            Some(PathBuf::from("/shop/wt2/status"))
        );
        config.validate().unwrap();
    }

    #[test]
    fn duplicate_machine_ids_rejected() {
        let toml_str = r#"
            [[machines]]
            id = 1
            name = "WT1"
            run_folder = "/a"

            [[machines]]
            id = 1
            name = "WT1b"
            run_folder = "/b"
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn mailbox_options_from_config() {
        let opts = HandoffConfig::default().mailbox_options();
        assert_eq!(opts.poll_interval, Duration::from_secs(1));
        assert_eq!(opts.timeout, Duration::from_secs(300));
        assert_eq!(opts.destination, "99");
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let missing = Path::new("/definitely/not/here/cutflow.toml");
        let config = EngineConfig::load(Some(missing)).unwrap();
        assert_eq!(config.pallet_slots, 20);
    }
}

//! Configuração do renderflow carregada de `renderflow.toml`.
//!
//! [`RenderflowConfig`] reúne todos os parâmetros ajustáveis. Campos ausentes
//! no arquivo usam valores padrão, e sem arquivo vale tudo padrão. As
//! variáveis de ambiente `RENDERFLOW_STATE_DIR` e `RENDERFLOW_SERVER` têm
//! precedência sobre o arquivo.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::planner::{DEFAULT_CHUNK_SIZE, StreamRequest};
use crate::state_machine::{Category, RetryConfig};

const DEFAULT_CONFIG_FILE: &str = "renderflow.toml";
const DEFAULT_SERVER: &str = "http://127.0.0.1:8188";

/// Configuração principal carregada de `renderflow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RenderflowConfig {
    /// Diretório dos checkpoints e leases das execuções.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Unidades por chunk para streams que não definem o seu.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Número máximo de retentativas antes de o job ser marcado como falho.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos do backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Limite de tempo de uma submissão de render.
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,

    /// Quanto o coordenador espera por uma conclusão antes de sondar de novo.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_reprobe_interval_secs")]
    pub reprobe_interval_secs: u64,

    /// Rodadas de sondagem sem nada executável antes de a execução desistir.
    #[serde(default = "default_stall_probe_limit")]
    pub stall_probe_limit: u32,

    /// Intervalo de consulta do backend HTTP por um prompt concluído.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Na retomada, executa de novo jobs concluídos cujas saídas locais sumiram.
    #[serde(default)]
    pub verify_outputs_on_resume: bool,

    /// Diretório de saída do backend, base das referências relativas de artefatos.
    #[serde(default)]
    pub artifact_root: Option<PathBuf>,

    /// Onde os artefatos finais são arquivados. Sem upload quando ausente.
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,

    #[serde(default)]
    pub workflows: WorkflowPaths,

    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// Um template de workflow JSON por categoria de job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowPaths {
    pub primary: Option<PathBuf>,
    pub refinement: Option<PathBuf>,
    pub combine: Option<PathBuf>,
}

impl WorkflowPaths {
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.refinement.is_none() && self.combine.is_none()
    }

    pub fn for_category(&self, category: Category) -> Option<&Path> {
        match category {
            Category::Primary => self.primary.as_deref(),
            Category::Refinement => self.refinement.as_deref(),
            Category::Combine => self.combine.as_deref(),
        }
    }
}

/// Um servidor de render vindo da configuração estática.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    /// URL base, por exemplo `http://10.0.0.5:8188`.
    pub address: String,
    #[serde(default = "all_categories")]
    pub categories: Vec<Category>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Pode assumir qualquer categoria que nenhuma outra instância saudável cubra.
    #[serde(default)]
    pub fallback: bool,
}

impl InstanceConfig {
    /// A instância local única usada quando nada foi configurado.
    pub fn local(address: &str) -> Self {
        Self {
            id: "local".to_string(),
            address: address.to_string(),
            categories: all_categories(),
            max_concurrent: 1,
            enabled: true,
            fallback: true,
        }
    }

    /// Interpreta `ID=URL[@cat,cat…][/N]`, a topologia passada pela CLI.
    pub fn parse_override(s: &str) -> Result<Self, String> {
        let (id, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected ID=URL[@categories][/N], got `{s}`"))?;
        if id.trim().is_empty() {
            return Err("instance id must not be empty".into());
        }

        let (rest, max_concurrent) = match rest.rsplit_once('/') {
            Some((head, n)) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => {
                let n: usize = n.parse().map_err(|e| format!("bad concurrency `{n}`: {e}"))?;
                (head, n.max(1))
            }
            _ => (rest, 1),
        };

        let (address, categories) = match rest.split_once('@') {
            Some((address, cats)) => {
                let categories = cats
                    .split(',')
                    .map(str::parse::<Category>)
                    .collect::<Result<Vec<_>, _>>()?;
                (address, categories)
            }
            None => (rest, all_categories()),
        };

        Ok(Self {
            id: id.trim().to_string(),
            address: address.trim().to_string(),
            categories,
            max_concurrent,
            enabled: true,
            fallback: false,
        })
    }
}

/// Parâmetros de execução do orquestrador, derivados da configuração.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub retry: RetryConfig,
    pub submit_timeout: Duration,
    pub idle_timeout: Duration,
    pub reprobe_interval: Duration,
    pub stall_probe_limit: u32,
    pub verify_outputs_on_resume: bool,
    pub artifact_root: Option<PathBuf>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".renderflow")
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    5000
}

fn default_submit_timeout_secs() -> u64 {
    3600
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_reprobe_interval_secs() -> u64 {
    15
}

fn default_stall_probe_limit() -> u32 {
    20
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_concurrent() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn all_categories() -> Vec<Category> {
    Category::ALL.to_vec()
}

impl Default for RenderflowConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            submit_timeout_secs: default_submit_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reprobe_interval_secs: default_reprobe_interval_secs(),
            stall_probe_limit: default_stall_probe_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            verify_outputs_on_resume: false,
            artifact_root: None,
            upload_dir: None,
            workflows: WorkflowPaths::default(),
            instances: Vec::new(),
        }
    }
}

impl RenderflowConfig {
    /// Carrega a configuração de `path`, ou de `renderflow.toml` no diretório
    /// atual quando nenhum caminho é dado. Só um caminho explícito precisa
    /// existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        if let Ok(dir) = std::env::var("RENDERFLOW_STATE_DIR")
            && !dir.is_empty()
        {
            config.state_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = toml::from_str::<RenderflowConfig>(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be positive");
        }
        let mut ids = std::collections::HashSet::new();
        for instance in &self.instances {
            if !ids.insert(instance.id.as_str()) {
                bail!("instance id `{}` is configured twice", instance.id);
            }
        }
        Ok(())
    }

    /// As instâncias configuradas, ou a instância local padrão se não houver nenhuma.
    pub fn effective_instances(&self) -> Vec<InstanceConfig> {
        if !self.instances.is_empty() {
            return self.instances.clone();
        }
        let server = std::env::var("RENDERFLOW_SERVER")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());
        vec![InstanceConfig::local(&server)]
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            retry: self.retry_config(),
            submit_timeout: Duration::from_secs(self.submit_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
            reprobe_interval: Duration::from_secs(self.reprobe_interval_secs),
            stall_probe_limit: self.stall_probe_limit,
            verify_outputs_on_resume: self.verify_outputs_on_resume,
            artifact_root: self.artifact_root.clone(),
        }
    }
}

/// Um lote de streams lido de um arquivo de plano JSON ou TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanFile {
    #[serde(default)]
    pub chunk_size: Option<u64>,
    pub streams: Vec<PlanStream>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanStream {
    pub name: String,
    pub total_units: u64,
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

impl PlanFile {
    /// Lê um plano; arquivos `.json` são lidos como JSON, os demais como TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan {}", path.display()))?;
        let plan = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&contents)?
        } else {
            toml::from_str(&contents)?
        };
        Ok(plan)
    }

    /// Resolve o tamanho de chunk: do stream, depois do arquivo, depois `default_chunk`.
    pub fn into_requests(self, default_chunk: u64) -> Vec<StreamRequest> {
        let file_chunk = self.chunk_size.unwrap_or(default_chunk);
        self.streams
            .into_iter()
            .map(|s| StreamRequest::new(s.name, s.total_units, s.chunk_size.unwrap_or(file_chunk)))
            .collect()
    }
}

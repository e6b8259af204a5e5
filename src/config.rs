use crate::llm::{LlmSettings, Provider, RetryPolicy};
use clap::{Parser, Subcommand, ValueEnum};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path (YAML, TOML or JSON)
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Graph identifier to operate on
    #[arg(long, env = "GRAPH_ID", default_value = "default")]
    pub graph_id: String,

    /// Disable community detection and reports
    #[arg(long, env = "COMMUNITY_DISABLED")]
    pub community_disabled: Option<bool>,

    /// Maximum in-flight model calls during extraction
    #[arg(long, env = "EXTRACTION_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Fixed seed for community detection
    #[arg(long, env = "COMMUNITY_SEED")]
    pub seed: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load documents from a file or directory, index them and build the graph
    Index {
        /// File or directory to ingest
        path: PathBuf,
        /// Ignore cached extraction results
        #[arg(long)]
        force_rebuild: bool,
        /// Write the built graph to this directory
        #[arg(long)]
        archive: Option<PathBuf>,
    },
    /// Ask a question against an archived graph
    Query {
        /// Archived graph directory
        #[arg(long)]
        archive: PathBuf,
        /// Search method (local, global, drift, basic)
        #[arg(long)]
        method: Option<String>,
        /// The question
        question: String,
    },
    /// Print statistics of an archived graph
    Stats {
        /// Archived graph directory
        archive: PathBuf,
    },
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub chunking: ChunkingConfig,
    pub extraction: ExtractionSettings,
    pub community: CommunitySettings,
    pub embedding: EmbeddingSettings,
    pub llm: LlmConfig,
    pub query: QueryConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategyKind {
    /// Strict sliding token window
    Tokens,
    /// Sentence-aware packing
    Sentences,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub size: usize,
    pub overlap: usize,
    pub strategy: ChunkStrategyKind,
    pub encoding: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExtractionSettings {
    pub entity_types: Vec<String>,
    pub max_gleanings: u32,
    pub max_retries: u32,
    pub concurrency: usize,
    #[serde(default)]
    pub requests_per_second: Option<u32>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CommunitySettings {
    pub enabled: bool,
    pub max_cluster_size: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    pub resolution: f64,
    pub max_iterations: usize,
    pub max_report_input_tokens: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingSettings {
    pub model: String,
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueryConfig {
    pub local_max_tokens: usize,
    pub global_max_tokens: usize,
    pub drift_max_tokens: usize,
    pub basic_max_tokens: usize,
    pub top_k_entities: usize,
    pub top_k_chunks: usize,
    pub global_level: u32,
    pub global_top_reports: usize,
    pub drift_max_rounds: usize,
    pub drift_follow_ups: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    pub root_dir: PathBuf,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Self::load_with_cli(&cli)
    }

    pub fn load_with_cli(cli: &Cli) -> Result<Self, config::ConfigError> {
        let mut builder = Self::defaults(Config::builder())?;

        // Config file
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path));
        }

        // Environment variables (prefixed with GRAPHRAG_), e.g. GRAPHRAG_CHUNKING__SIZE=600
        builder = builder.add_source(
            Environment::with_prefix("GRAPHRAG")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("extraction.entity_types")
                .try_parsing(true),
        );

        // Explicit CLI overrides win over everything else
        if let Some(disabled) = cli.community_disabled {
            builder = builder.set_override("community.enabled", !disabled)?;
        }
        if let Some(c) = cli.concurrency {
            builder = builder.set_override("extraction.concurrency", c as u64)?;
        }
        if let Some(seed) = cli.seed {
            builder = builder.set_override("community.seed", seed)?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        builder
            .set_default("chunking.size", 1200)?
            .set_default("chunking.overlap", 100)?
            .set_default("chunking.strategy", "sentences")?
            .set_default("chunking.encoding", "cl100k_base")?
            .set_default(
                "extraction.entity_types",
                vec!["organization", "person", "geo", "event"],
            )?
            .set_default("extraction.max_gleanings", 1)?
            .set_default("extraction.max_retries", 10)?
            .set_default("extraction.concurrency", 25)?
            .set_default("extraction.backoff_base_ms", 500)?
            .set_default("extraction.backoff_max_ms", 30_000)?
            .set_default("community.enabled", true)?
            .set_default("community.max_cluster_size", 10)?
            .set_default("community.seed", 0xDEAD_BEEF_u64)?
            .set_default("community.resolution", 1.0)?
            .set_default("community.max_iterations", 20)?
            .set_default("community.max_report_input_tokens", 8000)?
            .set_default("embedding.model", "BAAI/bge-small-en-v1.5")?
            .set_default("embedding.batch_size", 64)?
            .set_default("llm.base_url", "https://api.openai.com")?
            .set_default("llm.model", "gpt-4o-mini")?
            .set_default("llm.timeout_secs", 120)?
            .set_default("query.local_max_tokens", 12_000)?
            .set_default("query.global_max_tokens", 12_000)?
            .set_default("query.drift_max_tokens", 12_000)?
            .set_default("query.basic_max_tokens", 8_000)?
            .set_default("query.top_k_entities", 10)?
            .set_default("query.top_k_chunks", 5)?
            .set_default("query.global_level", 0)?
            .set_default("query.global_top_reports", 5)?
            .set_default("query.drift_max_rounds", 2)?
            .set_default("query.drift_follow_ups", 3)?
            .set_default("storage.root_dir", "./graphrag_data")
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        let fail = |m: &str| Err(config::ConfigError::Message(m.to_string()));
        if self.chunking.size == 0 {
            return fail("chunking.size must be positive");
        }
        if self.chunking.overlap >= self.chunking.size {
            return fail("chunking.overlap must be less than chunking.size");
        }
        if self.extraction.entity_types.is_empty() {
            return fail("extraction.entity_types cannot be empty");
        }
        if self.extraction.concurrency == 0 {
            return fail("extraction.concurrency must be at least 1");
        }
        if self.community.max_cluster_size < 2 {
            return fail("community.max_cluster_size must be at least 2");
        }
        Ok(())
    }

    /// Retry policy for extraction and summarisation calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.extraction.max_retries,
            base_delay: Duration::from_millis(self.extraction.backoff_base_ms),
            max_delay: Duration::from_millis(self.extraction.backoff_max_ms),
        }
    }

    /// Model connection settings; `LLM_API_KEY` is read when the config has none.
    pub fn llm_settings(&self) -> LlmSettings {
        let api_key = self
            .llm
            .api_key
            .clone()
            .or_else(|| std::env::var("LLM_API_KEY").ok())
            .filter(|s| !s.trim().is_empty());

        let mut provider = Provider::detect_from_url(&self.llm.base_url);
        if let Provider::AzureOpenAI { api_version, .. } = &provider {
            if let Ok(deployment) = std::env::var("AZURE_DEPLOYMENT_NAME") {
                provider = Provider::AzureOpenAI {
                    deployment_name: deployment,
                    api_version: std::env::var("AZURE_API_VERSION")
                        .unwrap_or_else(|_| api_version.clone()),
                };
            }
        }

        LlmSettings {
            base_url: self.llm.base_url.clone(),
            api_key,
            model: self.llm.model.clone(),
            provider,
            timeout: Duration::from_secs(self.llm.timeout_secs),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig {
                size: 1200,
                overlap: 100,
                strategy: ChunkStrategyKind::Sentences,
                encoding: "cl100k_base".to_string(),
            },
            extraction: ExtractionSettings {
                entity_types: ["organization", "person", "geo", "event"]
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                max_gleanings: 1,
                max_retries: 10,
                concurrency: 25,
                requests_per_second: None,
                backoff_base_ms: 500,
                backoff_max_ms: 30_000,
            },
            community: CommunitySettings {
                enabled: true,
                max_cluster_size: 10,
                seed: Some(0xDEAD_BEEF),
                resolution: 1.0,
                max_iterations: 20,
                max_report_input_tokens: 8000,
            },
            embedding: EmbeddingSettings {
                model: "BAAI/bge-small-en-v1.5".to_string(),
                batch_size: 64,
            },
            llm: LlmConfig {
                base_url: "https://api.openai.com".to_string(),
                api_key: None,
                model: "gpt-4o-mini".to_string(),
                timeout_secs: 120,
            },
            query: QueryConfig {
                local_max_tokens: 12_000,
                global_max_tokens: 12_000,
                drift_max_tokens: 12_000,
                basic_max_tokens: 8_000,
                top_k_entities: 10,
                top_k_chunks: 5,
                global_level: 0,
                global_top_reports: 5,
                drift_max_rounds: 2,
                drift_follow_ups: 3,
            },
            storage: StorageConfig {
                root_dir: PathBuf::from("./graphrag_data"),
                cache_dir: None,
            },
        }
    }
}

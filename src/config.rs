//! TOML configuration.
//!
//! The whole pipeline is driven by one [`Config`] loaded at process start and
//! passed down by reference. Every section has defaults, so an empty file is a
//! valid configuration for a local AEM author instance on port 4502.
//!
//! ```toml
//! [source]
//! base_url = "http://localhost:4502"
//! username = "admin"
//! password = "admin"
//! roots = ["/content/we-retail", "/conf/we-retail"]
//!
//! [crawl]
//! max_depth = 6
//!
//! [storage]
//! corpus_path = "./data/aem_flattened_inventory.jsonl"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-large"
//! batch_size = 10
//! save_every_batches = 20
//! ```

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use aem_rag_core::flatten::FlattenOptions;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Environment variable holding the model provider credential.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            crawl: CrawlConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            llm: LlmConfig::default(),
            server: ServerConfig::default(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Config {
    /// Resolve the provider credential if a command's providers need one.
    ///
    /// Called once at startup; a missing credential stops the command before
    /// any work is done.
    pub fn resolve_credential(&self, embeds: bool, generates: bool) -> Result<Option<Credential>> {
        let needed = (embeds && self.embedding.needs_credential())
            || (generates && self.llm.needs_credential());
        if needed {
            Ok(Some(Credential::from_env(&self.api_key_env)?))
        } else {
            Ok(None)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
    /// Paths to crawl. Empty means: crawl every child of `discovery_root`.
    #[serde(default)]
    pub roots: Vec<String>,
    #[serde(default = "default_discovery_root")]
    pub discovery_root: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            username: None,
            password: None,
            timeout_secs: default_source_timeout(),
            roots: Vec::new(),
            discovery_root: default_discovery_root(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:4502".to_string()
}
fn default_source_timeout() -> u64 {
    20
}
fn default_discovery_root() -> String {
    "/content".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    /// Shared bound for crawl recursion and flattening.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Child names matching any of these globs are not crawled.
    #[serde(default = "default_reserved_globs")]
    pub reserved_globs: Vec<String>,
    #[serde(default = "default_max_value_chars")]
    pub max_value_chars: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            reserved_globs: default_reserved_globs(),
            max_value_chars: default_max_value_chars(),
        }
    }
}

fn default_max_depth() -> usize {
    6
}
fn default_reserved_globs() -> Vec<String> {
    vec!["jcr:*".to_string(), "rep:*".to_string()]
}
fn default_max_value_chars() -> usize {
    2000
}

impl CrawlConfig {
    pub fn flatten_options(&self) -> FlattenOptions {
        FlattenOptions {
            max_depth: self.max_depth,
            max_value_chars: self.max_value_chars,
        }
    }

    pub fn reserved_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.reserved_globs {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Invalid reserved glob: {}", pattern))?,
            );
        }
        Ok(builder.build()?)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_corpus_path")]
    pub corpus_path: PathBuf,
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
    #[serde(default = "default_metadata_path")]
    pub metadata_path: PathBuf,
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    /// Corpus for keyword scoring. Defaults to `metadata_path`.
    #[serde(default)]
    pub keyword_corpus_path: Option<PathBuf>,
    #[serde(default)]
    pub lock_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            corpus_path: default_corpus_path(),
            index_path: default_index_path(),
            metadata_path: default_metadata_path(),
            checkpoint_path: default_checkpoint_path(),
            keyword_corpus_path: None,
            lock_path: None,
        }
    }
}

fn default_corpus_path() -> PathBuf {
    PathBuf::from("./data/aem_flattened_inventory.jsonl")
}
fn default_index_path() -> PathBuf {
    PathBuf::from("./data/aem_index.vec")
}
fn default_metadata_path() -> PathBuf {
    PathBuf::from("./data/aem_index_meta.json")
}
fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("./data/index_state.json")
}

impl StorageConfig {
    pub fn keyword_corpus(&self) -> &Path {
        self.keyword_corpus_path
            .as_deref()
            .unwrap_or(&self.metadata_path)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.lock_path
            .clone()
            .unwrap_or_else(|| self.index_path.with_extension("lock"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Expected dimension. When unset it is taken from the first batch.
    #[serde(default)]
    pub dims: Option<usize>,
    /// Provider base URL override (OpenAI-compatible gateway, Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_save_every")]
    pub save_every_batches: usize,
    #[serde(default = "default_retry_pause_ms")]
    pub retry_pause_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            save_every_batches: default_save_every(),
            retry_pause_ms: default_retry_pause_ms(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_save_every() -> usize {
    20
}
fn default_retry_pause_ms() -> u64 {
    5000
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn needs_credential(&self) -> bool {
        self.provider == "openai"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k_dense")]
    pub k_dense: usize,
    #[serde(default = "default_k_sparse")]
    pub k_sparse: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_dense: default_k_dense(),
            k_sparse: default_k_sparse(),
        }
    }
}

fn default_k_dense() -> usize {
    8
}
fn default_k_sparse() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            url: None,
            temperature: 0.0,
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_timeout() -> u64 {
    60
}

impl LlmConfig {
    pub fn needs_credential(&self) -> bool {
        self.provider == "openai"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

/// Model provider credential, resolved once at startup.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    /// Read the credential from `var`. A missing or blank value is fatal.
    pub fn from_env(var: &str) -> Result<Self> {
        match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => Ok(Self(v)),
            _ => bail!("{} environment variable not set", var),
        }
    }

    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Read, parse and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.crawl.max_depth == 0 {
        bail!("crawl.max_depth must be > 0");
    }
    config.crawl.reserved_set()?;

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.save_every_batches == 0 {
        bail!("embedding.save_every_batches must be > 0");
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0 when set");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.retrieval.k_dense == 0 || config.retrieval.k_sparse == 0 {
        bail!("retrieval.k_dense and retrieval.k_sparse must be >= 1");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.source.base_url, "http://localhost:4502");
        assert_eq!(cfg.crawl.max_depth, 6);
        assert_eq!(cfg.embedding.batch_size, 10);
        assert_eq!(cfg.embedding.save_every_batches, 20);
        assert_eq!(cfg.retrieval.k_dense, 8);
        assert_eq!(cfg.retrieval.k_sparse, 4);
        assert_eq!(cfg.api_key_env, "OPENAI_API_KEY");
        assert_eq!(cfg.storage.keyword_corpus(), cfg.storage.metadata_path.as_path());
        assert_eq!(cfg.storage.lock_file(), PathBuf::from("./data/aem_index.lock"));
    }

    #[test]
    fn reserved_globs_match_jcr_names() {
        let set = CrawlConfig::default().reserved_set().unwrap();
        assert!(set.is_match("jcr:content"));
        assert!(set.is_match("rep:policy"));
        assert!(!set.is_match("men"));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = parse_config("[embedding]\nbatch_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn rejects_unknown_provider() {
        assert!(parse_config("[embedding]\nprovider = \"magic\"\n").is_err());
        assert!(parse_config("[llm]\nprovider = \"magic\"\n").is_err());
    }

    #[test]
    fn rejects_zero_depth() {
        assert!(parse_config("[crawl]\nmax_depth = 0\n").is_err());
    }

    #[test]
    fn credential_debug_is_redacted() {
        let cred = Credential::new("sk-secret");
        assert_eq!(format!("{:?}", cred), "Credential(***)");
        assert_eq!(cred.secret(), "sk-secret");
    }

    #[test]
    fn credential_only_resolved_when_needed() {
        let cfg = parse_config(
            "api_key_env = \"AEM_RAG_TEST_UNSET_KEY\"\n[embedding]\nprovider = \"ollama\"\n",
        )
        .unwrap();
        assert!(cfg.resolve_credential(true, false).unwrap().is_none());
        assert!(cfg.resolve_credential(true, true).is_err());
    }

    #[test]
    fn missing_credential_is_an_error() {
        let err = Credential::from_env("AEM_RAG_TEST_UNSET_KEY").unwrap_err();
        assert!(err.to_string().contains("AEM_RAG_TEST_UNSET_KEY"));
    }
}

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/property_management.duckdb".to_string(),
            pool_size: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// Sessions idle for longer than this are dropped.
    pub session_ttl_secs: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            session_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: String, // "remote" or "ollama"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".to_string(),
            model: "sqlcoder".to_string(),
            api_key: None,
            api_url: None,
            temperature: 0.0,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub max_retries: u32,
    pub max_history: usize,
    pub answer_tolerance: f64,
    pub valid_threshold: f64,
    pub low_confidence_threshold: f64,
    /// Exposes raw error detail in responses.
    pub debug_mode: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_history: 10,
            answer_tolerance: 0.02,
            valid_threshold: 0.5,
            low_confidence_threshold: 0.25,
            debug_mode: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub admin_password: String,
    pub viewer_password: String,
    /// Owner N authenticates with this prefix followed by N.
    pub owner_password_prefix: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_password: "admin".to_string(),
            viewer_password: "viewer".to_string(),
            owner_password_prefix: "llc".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub auth: AuthConfig,
    pub schema_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            web: WebConfig::default(),
            llm: LlmConfig::default(),
            agent: AgentConfig::default(),
            auth: AuthConfig::default(),
            schema_path: "schema/property_management.json".to_string(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Path to the DuckDB database file
    #[arg(long, global = true)]
    pub database: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the HTTP API and web UI
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Interactive chat session in the terminal
    Chat {
        /// Show raw error details in answers
        #[arg(long)]
        debug: bool,
    },
    /// Create the mock property-management database
    Seed {
        /// Replace an existing database file
        #[arg(long)]
        force: bool,
    },
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            let default_locations = [
                "config.toml",
                "config/config.toml",
                "/etc/nl-property/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // NL_PROPERTY__LLM__API_KEY=... overrides llm.api_key
        config_builder = config_builder.add_source(
            Environment::with_prefix("NL_PROPERTY")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        if let Some(database) = &args.database {
            config.database.path = database.clone();
        }
        match &args.command {
            Command::Serve { host, port } => {
                if let Some(host) = host {
                    config.web.host = host.clone();
                }
                if let Some(port) = port {
                    config.web.port = *port;
                }
            }
            Command::Chat { debug } => {
                config.agent.debug_mode |= *debug;
            }
            Command::Seed { .. } => {}
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.web.session_ttl_secs == 0 {
            return Err(ConfigError::Message("web.session_ttl_secs must be at least 1".to_string()));
        }
        let agent = &self.agent;
        if agent.max_retries == 0 {
            return Err(ConfigError::Message("agent.max_retries must be at least 1".to_string()));
        }
        for (name, value) in [
            ("agent.answer_tolerance", agent.answer_tolerance),
            ("agent.valid_threshold", agent.valid_threshold),
            ("agent.low_confidence_threshold", agent.low_confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Message(format!("{} must be between 0 and 1", name)));
            }
        }
        Ok(())
    }
}

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_PACK_SERIAL_PREFIX: &str = "PK";
const CONFIG_DIR: &str = "config";

/// Engine behaviour switches
#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Prefix for generated pack serials (`{prefix}-{YYYYMMDD}-{seq}`)
    #[validate(length(min = 1, max = 16), custom = "validate_serial_prefix")]
    #[serde(default = "default_pack_serial_prefix")]
    pub pack_serial_prefix: String,

    /// When set, binding a cell still in GENERATED needs a privileged override
    #[serde(default)]
    pub require_scan_before_bind: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pack_serial_prefix: default_pack_serial_prefix(),
            require_scan_before_bind: false,
        }
    }
}

/// Raw permission table as written in configuration.
///
/// `clusters.<cluster>.<screen>` holds verb letters, e.g. `"VCX"`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizationConfig {
    #[serde(default)]
    pub super_cluster: Option<String>,

    /// role → cluster
    #[serde(default)]
    pub roles: HashMap<String, String>,

    #[serde(default)]
    pub clusters: HashMap<String, HashMap<String, String>>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        let roles = [
            ("plant_admin", "plant_admin"),
            ("design_engineer", "engineering"),
            ("receiving_clerk", "inbound"),
            ("line_operator", "line_ops"),
            ("line_supervisor", "line_leads"),
            ("quality_engineer", "quality"),
            ("auditor", "audit"),
        ];

        let clusters: [(&str, &[(&str, &str)]); 6] = [
            (
                "engineering",
                &[("blueprints", "VCEAM"), ("lineage", "V"), ("modules", "V")],
            ),
            ("inbound", &[("cell_lots", "VCEX"), ("lineage", "V")]),
            (
                "line_ops",
                &[
                    ("cell_lots", "VX"),
                    ("modules", "VCEX"),
                    ("packs", "VCEX"),
                    ("blueprints", "V"),
                    ("lineage", "V"),
                ],
            ),
            (
                "line_leads",
                &[
                    ("cell_lots", "VCEXM"),
                    ("modules", "VCEXAM"),
                    ("packs", "VCEXAM"),
                    ("blueprints", "V"),
                    ("eol", "V"),
                    ("lineage", "V"),
                ],
            ),
            (
                "quality",
                &[
                    ("packs", "VEA"),
                    ("eol", "VCEXAM"),
                    ("quarantine", "VCEAM"),
                    ("modules", "VXA"),
                    ("lineage", "V"),
                ],
            ),
            (
                "audit",
                &[
                    ("blueprints", "V"),
                    ("cell_lots", "V"),
                    ("modules", "V"),
                    ("packs", "V"),
                    ("eol", "V"),
                    ("quarantine", "V"),
                    ("lineage", "V"),
                ],
            ),
        ];

        Self {
            super_cluster: Some("plant_admin".to_string()),
            roles: roles
                .iter()
                .map(|(role, cluster)| (role.to_string(), cluster.to_string()))
                .collect(),
            clusters: clusters
                .iter()
                .map(|(cluster, screens)| {
                    (
                        cluster.to_string(),
                        screens
                            .iter()
                            .map(|(screen, verbs)| (screen.to_string(), verbs.to_string()))
                            .collect(),
                    )
                })
                .collect(),
        }
    }
}

/// One row of the EOL test matrix template
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EolItemTemplate {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true_bool")]
    pub required: bool,
    #[serde(default)]
    pub unit: Option<String>,
    /// `< N` or `> N`; absent for manual items
    #[serde(default)]
    pub threshold: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EolConfig {
    #[serde(default = "default_eol_items")]
    pub items: Vec<EolItemTemplate>,
}

impl Default for EolConfig {
    fn default() -> Self {
        Self {
            items: default_eol_items(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[validate(custom = "validate_log_level")]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Capacity of the domain event channel
    #[validate(custom = "validate_event_channel_capacity")]
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    #[validate]
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub authorization: AuthorizationConfig,

    #[serde(default)]
    pub eol: EolConfig,
}

impl AppConfig {
    /// Creates a new AppConfig with built-in engine defaults
    pub fn new(host: String, port: u16, environment: String) -> Self {
        Self {
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            event_channel_capacity: default_event_channel_capacity(),
            engine: EngineConfig::default(),
            authorization: AuthorizationConfig::default(),
            eol: EolConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case(DEFAULT_ENV)
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Some(super_cluster) = &self.authorization.super_cluster {
            let granted = self.authorization.roles.values().any(|c| c == super_cluster);
            if !granted && self.is_production() {
                let mut err = ValidationError::new("super_cluster_unmapped");
                err.message = Some(
                    "authorization.super_cluster must be assigned to at least one role in production"
                        .into(),
                );
                errors.add("authorization", err);
            }
        }

        for (role, cluster) in &self.authorization.roles {
            let known = self.authorization.clusters.contains_key(cluster)
                || self.authorization.super_cluster.as_deref() == Some(cluster.as_str());
            if !known {
                let mut err = ValidationError::new("role_cluster_unknown");
                err.message =
                    Some(format!("role '{}' maps to undefined cluster '{}'", role, cluster).into());
                errors.add("authorization", err);
            }
        }

        if self.eol.items.is_empty() {
            let mut err = ValidationError::new("eol_items_empty");
            err.message = Some("eol.items must define at least one test item".into());
            errors.add("eol", err);
        }

        let mut seen = std::collections::HashSet::new();
        for item in &self.eol.items {
            if !seen.insert(item.id.as_str()) {
                let mut err = ValidationError::new("eol_item_duplicate");
                err.message = Some(format!("duplicate EOL item id '{}'", item.id).into());
                errors.add("eol", err);
            }
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_pack_serial_prefix() -> String {
    DEFAULT_PACK_SERIAL_PREFIX.to_string()
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_true_bool() -> bool {
    true
}

fn default_eol_items() -> Vec<EolItemTemplate> {
    let item = |id: &str, name: &str, required: bool, unit: Option<&str>, threshold: Option<&str>| {
        EolItemTemplate {
            id: id.to_string(),
            name: name.to_string(),
            required,
            unit: unit.map(str::to_string),
            threshold: threshold.map(str::to_string),
        }
    };

    vec![
        item(
            "insulation_resistance",
            "Insulation resistance",
            true,
            Some("MOhm"),
            Some("> 500"),
        ),
        item("hipot_leakage", "HiPot leakage current", true, Some("mA"), Some("< 5")),
        item(
            "cell_voltage_delta",
            "Cell voltage spread",
            true,
            Some("mV"),
            Some("< 30"),
        ),
        item("bms_comm", "BMS communication check", true, None, None),
        item("visual", "Visual inspection", true, None, None),
        item("thermal_sensor", "Thermal sensor plausibility", false, None, None),
    ]
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_serial_prefix(prefix: &str) -> Result<(), ValidationError> {
    if prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("pack_serial_prefix");
        err.message = Some("pack_serial_prefix must be ASCII alphanumeric".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("packtrace_api={},packtrace={},tower_http=debug", level, level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration from `./config`
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (`<dir>/default.toml`)
/// 3. Environment-specific config (`<dir>/{env}.toml`)
/// 4. Environment variables (APP__*)
pub fn load_config_from(dir: &Path) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            dir.display()
        );
    }

    let config = Config::builder()
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&dir.join("default").to_string_lossy()).required(false))
        .add_source(File::with_name(&dir.join(&run_env).to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File as StdFile;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, filename: &str, content: &str) {
        let mut file = StdFile::create(dir.path().join(filename)).unwrap();
        writeln!(file, "{}", content).unwrap();
    }

    #[test]
    fn loads_layered_file_config() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "default.toml",
            r#"
            host = "127.0.0.1"
            port = 9090
            environment = "development"
            log_level = "debug"

            [engine]
            pack_serial_prefix = "BP"
            require_scan_before_bind = true

            [authorization]
            super_cluster = "root"

            [authorization.roles]
            operator = "line_ops"
            admin = "root"

            [authorization.clusters.line_ops]
            modules = "VX"

            [[eol.items]]
            id = "hipot"
            name = "HiPot"
            unit = "mA"
            threshold = "< 5"
            "#,
        );

        let config = load_config_from(dir.path()).unwrap();

        assert_eq!(config.port, 9090);
        assert_eq!(config.engine.pack_serial_prefix, "BP");
        assert!(config.engine.require_scan_before_bind);
        assert_eq!(config.authorization.super_cluster.as_deref(), Some("root"));
        assert_eq!(
            config.authorization.clusters["line_ops"]["modules"],
            "VX".to_string()
        );
        assert_eq!(config.eol.items.len(), 1);
        assert!(config.eol.items[0].required);
    }

    #[test]
    fn missing_directory_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config_from(&dir.path().join("absent")).unwrap();
        assert_eq!(config.engine.pack_serial_prefix, DEFAULT_PACK_SERIAL_PREFIX);
        assert_eq!(config.eol.items.len(), default_eol_items().len());
    }

    #[test]
    fn invalid_values_fail_validation() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "default.toml",
            r#"
            host = "127.0.0.1"
            environment = "development"
            log_level = "shouting"
            event_channel_capacity = 0
            "#,
        );

        let result = load_config_from(dir.path());
        assert!(matches!(result, Err(AppConfigError::Validation(_))));
    }
}

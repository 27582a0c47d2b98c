use std::{borrow::Cow, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment, Provider,
};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::level_filters::LevelFilter;

use crate::{
    harvest::Endpoint,
    keystore::{CredentialReference, KeystorePassword, KeystoreTarget, KeystoreType},
};

mod validate;

pub use validate::check_config;

fn default_keystore_type() -> KeystoreType {
    KeystoreType::Pkcs12
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Trace,
}

/// Transforms our custom `LogLevel` enum into a `tracing::level_filters::LevelFilter`
/// enum used by the `tracing` crate.
impl From<&LogLevel> for LevelFilter {
    fn from(val: &LogLevel) -> Self {
        match val {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone, Args)]
#[group(id = "logging")]
pub struct Logging {
    /// The level of logging to be used.
    #[serde(deserialize_with = "log_level_deser")]
    #[arg(
        long = "log.level",
        required = false,
        value_enum,
        default_value = "info"
    )]
    pub level: LogLevel,

    /// The format of the log output
    #[serde(deserialize_with = "log_format_deser")]
    #[arg(
        long = "log.format",
        required = false,
        value_enum,
        default_value = "pretty"
    )]
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Args)]
#[group(id = "harvest")]
pub struct Harvest {
    /// The host presenting the certificate to harvest
    #[arg(
        long = "harvest.host",
        required = false,
        value_parser,
        default_value = Endpoint::PRODUCTION_HOST,
        id = "harvest.host"
    )]
    pub host: Cow<'static, str>,

    /// The TLS port of the host
    #[arg(
        long = "harvest.port",
        required = false,
        value_parser,
        default_value = "2196",
        id = "harvest.port"
    )]
    pub port: u16,

    /// Bound (in seconds) for connecting and completing the handshake
    #[arg(
        long = "harvest.timeout_secs",
        required = false,
        value_parser,
        default_value = "10",
        id = "harvest.timeout_secs"
    )]
    pub timeout_secs: u64,
}

impl Harvest {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.as_ref(), self.port)
            .with_timeout(Duration::from_secs(self.timeout_secs))
    }
}

impl Default for Harvest {
    fn default() -> Self {
        Self {
            host: Cow::Borrowed(Endpoint::PRODUCTION_HOST),
            port: Endpoint::DEFAULT_PORT,
            timeout_secs: Endpoint::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

/// A push server whose client keystore is loaded by `pushkeys load`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Unique name, also used to serialize keystore loads for this server
    pub name: Cow<'static, str>,

    /// Path to the keystore file (PKCS#12 or PEM)
    pub keystore: Option<PathBuf>,

    #[serde(default = "default_keystore_type")]
    pub keystore_type: KeystoreType,

    pub keystore_password: Option<KeystorePassword>,
}

impl KeystoreTarget for ServerConfig {
    fn identity(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.name)
    }

    fn keystore_type(&self) -> KeystoreType {
        self.keystore_type
    }

    fn keystore_password(&self) -> Option<&str> {
        self.keystore_password.as_ref().map(KeystorePassword::expose)
    }

    fn keystore_reference(&self) -> Option<CredentialReference> {
        self.keystore.clone().map(CredentialReference::Path)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Harvest the leaf certificate presented by the configured endpoint
    Harvest {
        /// Write the harvested certificate to this file as PEM
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Load the keystores of the configured servers
    Load {
        /// Only load the server with this name
        #[arg(long)]
        server: Option<String>,
    },
    /// Validate the keystore references of the configured servers without decoding them
    Check,
}

/// The main configuration struct.
/// A configuration file (YAML or through ENV) will be parsed into this struct.
/// Example:
///
/// ```yaml
/// logging:
///   level: "DEBUG"
///   format: "json"
/// harvest:
///   host: "feedback.sandbox.push.apple.com"
///   port: 2196
///   timeout_secs: 10
/// servers:
///   - name: "production"
///     keystore: "/etc/pushkeys/production.p12"
///     keystore_type: "PKCS12"
///     keystore_password: "changeit"
/// ```
///
#[derive(Debug, Serialize, Deserialize, Parser)]
#[command(name = "pushkeys")]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The PATH to the configuration file to be used.
    ///
    /// Either a directory containing `pushkeys.yaml`/`pushkeys.yml`
    /// or a direct path to a YAML file.
    #[clap(short, required = false, long)]
    #[allow(clippy::struct_field_names)]
    pub config_path: Option<Cow<'static, str>>,

    #[serde(skip)]
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub logging: Logging,

    #[command(flatten)]
    pub harvest: Harvest,

    #[clap(skip)]
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            config_path: None,
            command: None,
            logging: Logging::default(),
            harvest: Harvest::default(),
            servers: vec![],
        }
    }
}

/// Implement the `Provider` trait for the `Config` struct.
/// This allows the `Config` struct to be used as a configuration provider with *defaults*.
impl Provider for Config {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("pushkeys")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(Config::default()).data()
    }
}

/// Load the configuration from the command line, the configuration file and
/// the environment as a `Config` struct.
///
/// Nested keys can be separated by double underscores (__) in the environment variables.
/// E.g. `PUSHKEYS_LOGGING__LEVEL=DEBUG` will set the `level` key in the `logging` key.
pub fn load(fallback: &str) -> Result<Config, figment::Error> {
    let parsed_commands = Config::parse();

    let path_with_fallback = match &parsed_commands.config_path {
        Some(path) => path.to_string(),
        None => fallback.to_string(),
    };

    let mut config = load_from_path(&path_with_fallback, &parsed_commands)?;
    config.command = parsed_commands.command;

    Ok(config)
}

/// Load configuration from a specific path (file or directory)
pub fn load_from_path(config_path: &str, parsed_commands: &Config) -> Result<Config, figment::Error> {
    let mut figment = Figment::new()
        .merge(Config::default())
        .merge(Serialized::defaults(parsed_commands));

    if std::path::Path::new(config_path).is_file() {
        figment = figment.merge(Yaml::file(config_path));
    } else {
        figment = figment
            .merge(Yaml::file(format!("{config_path}/pushkeys.yml")))
            .merge(Yaml::file(format!("{config_path}/pushkeys.yaml")));
    }

    let config: Config = figment
        .merge(Env::prefixed("PUSHKEYS_").split("__"))
        .extract()?;

    // validate configuration and throw error upwards
    check_config(&config).map_err(|err| figment::Error::from(err.to_string()))?;

    Ok(config)
}

/// Deserialize function to convert a string to a `LogLevel` Enum
fn log_level_deser<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match s.to_lowercase().as_str() {
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        "trace" => Ok(LogLevel::Trace),
        _ => Err(serde::de::Error::custom(
            "expected one of DEBUG, INFO, WARN, ERROR, TRACE",
        )),
    }
}

/// Deserialize function to convert a string to a `LogFormat` Enum
fn log_format_deser<'de, D>(deserializer: D) -> Result<LogFormat, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match s.to_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "pretty" => Ok(LogFormat::Pretty),
        _ => Err(serde::de::Error::custom("expected one of JSON, PRETTY")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_for_test(path: &str) -> Result<Config, figment::Error> {
        load_from_path(path, &Config::default())
    }

    fn helper_config_file() -> &'static str {
        r#"
        logging:
          level: "DEBUG"
          format: "json"

        harvest:
          host: "feedback.sandbox.push.apple.com"
          timeout_secs: 5

        servers:
          - name: "production"
            keystore: "/etc/pushkeys/production.p12"
            keystore_password: "changeit"
          - name: "development"
            keystore: "/etc/pushkeys/development.pem"
            keystore_type: "pem"
        "#
    }

    #[test]
    fn test_load_config_with_defaults_only() {
        figment::Jail::expect_with(|jail| {
            let tmp_dir = jail.directory().to_string_lossy().into_owned();

            let config = load_for_test(&tmp_dir)?;
            assert_eq!(config.logging.level, LogLevel::Info);
            assert_eq!(config.logging.format, LogFormat::Pretty);
            assert_eq!(config.harvest.endpoint(), Endpoint::production());
            assert!(config.servers.is_empty());

            Ok(())
        });
    }

    #[test]
    fn test_load_config_from_yaml() {
        figment::Jail::expect_with(|jail| {
            let tmp_dir = jail.directory().to_string_lossy().into_owned();
            jail.create_file(format!("{tmp_dir}/pushkeys.yaml"), helper_config_file())?;

            let config = load_for_test(&tmp_dir)?;
            assert_eq!(config.logging.level, LogLevel::Debug);
            assert_eq!(config.logging.format, LogFormat::Json);

            let endpoint = config.harvest.endpoint();
            assert_eq!(endpoint.host, "feedback.sandbox.push.apple.com");
            assert_eq!(endpoint.port, 2196);
            assert_eq!(endpoint.timeout, Duration::from_secs(5));

            assert_eq!(config.servers.len(), 2);
            let production = &config.servers[0];
            assert_eq!(production.identity(), "production");
            assert_eq!(production.keystore_type(), KeystoreType::Pkcs12);
            assert_eq!(production.keystore_password(), Some("changeit"));
            assert!(matches!(
                production.keystore_reference(),
                Some(CredentialReference::Path(_))
            ));

            let development = &config.servers[1];
            assert_eq!(development.keystore_type(), KeystoreType::Pem);
            assert_eq!(development.keystore_password(), None);

            Ok(())
        });
    }

    #[test]
    fn test_load_config_from_direct_file_path() {
        figment::Jail::expect_with(|jail| {
            let tmp_dir = jail.directory().to_string_lossy().into_owned();
            let config_file_path = format!("{tmp_dir}/custom.yml");
            jail.create_file(
                &config_file_path,
                r#"
                harvest:
                  host: "localhost"
                  port: 8443
                "#,
            )?;

            let config = load_for_test(&config_file_path)?;
            assert_eq!(config.harvest.host, "localhost");
            assert_eq!(config.harvest.port, 8443);

            Ok(())
        });
    }

    #[test]
    fn test_load_config_from_yaml_and_env_vars() {
        figment::Jail::expect_with(|jail| {
            let tmp_dir = jail.directory().to_string_lossy().into_owned();
            jail.create_file(format!("{tmp_dir}/pushkeys.yml"), helper_config_file())?;
            jail.set_env("PUSHKEYS_HARVEST__PORT", 2197);
            jail.set_env("PUSHKEYS_LOGGING__LEVEL", "WARN");

            let config = load_for_test(&tmp_dir)?;
            assert_eq!(config.harvest.port, 2197);
            assert_eq!(config.harvest.host, "feedback.sandbox.push.apple.com");
            assert_eq!(config.logging.level, LogLevel::Warn);

            Ok(())
        });
    }

    #[test]
    fn test_unknown_keystore_type_is_rejected() {
        figment::Jail::expect_with(|jail| {
            let tmp_dir = jail.directory().to_string_lossy().into_owned();
            jail.create_file(
                format!("{tmp_dir}/pushkeys.yaml"),
                r#"
                servers:
                  - name: "legacy"
                    keystore: "/etc/pushkeys/legacy.jks"
                    keystore_type: "JKS"
                "#,
            )?;

            assert!(load_for_test(&tmp_dir).is_err());

            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level_is_rejected() {
        figment::Jail::expect_with(|jail| {
            let tmp_dir = jail.directory().to_string_lossy().into_owned();
            jail.create_file(
                format!("{tmp_dir}/pushkeys.yaml"),
                r#"
                logging:
                  level: "LOUD"
                "#,
            )?;

            assert!(load_for_test(&tmp_dir).is_err());

            Ok(())
        });
    }

    #[test]
    fn test_validation_errors_surface_from_load() {
        figment::Jail::expect_with(|jail| {
            let tmp_dir = jail.directory().to_string_lossy().into_owned();
            jail.create_file(
                format!("{tmp_dir}/pushkeys.yaml"),
                r#"
                harvest:
                  timeout_secs: 0
                "#,
            )?;

            let err = load_for_test(&tmp_dir).unwrap_err();
            assert!(err.to_string().contains("harvest.timeout_secs"));

            Ok(())
        });
    }
}

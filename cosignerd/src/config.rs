use std::{path::PathBuf, str::FromStr};

use miniscript::bitcoin::Network;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

fn deserialize_fromstr<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let string = String::deserialize(deserializer)?;
    T::from_str(&string)
        .map_err(|e| de::Error::custom(format!("Error parsing '{}': {}", string, e)))
}

pub fn serialize_to_string<T: std::fmt::Display, S: Serializer>(
    field: T,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_str(&field.to_string())
}

fn default_loglevel() -> log::LevelFilter {
    log::LevelFilter::Info
}

/// Static informations we require to operate
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// An optional custom data directory
    pub data_dir: Option<PathBuf>,
    /// What messages to log
    #[serde(
        deserialize_with = "deserialize_fromstr",
        serialize_with = "serialize_to_string",
        default = "default_loglevel"
    )]
    pub log_level: log::LevelFilter,
    /// The network we are operating on, one of "bitcoin", "testnet", "regtest", "signet". Keys
    /// and descriptors for another network are refused.
    pub network: Network,
}

impl Config {
    pub fn new(network: Network, data_dir: Option<PathBuf>) -> Self {
        Self {
            data_dir,
            log_level: default_loglevel(),
            network,
        }
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone().or_else(config_folder_path)
    }
}

#[derive(PartialEq, Eq, Debug)]
pub enum ConfigError {
    DatadirNotFound,
    FileNotFound,
    ReadingFile(String),
    Unexpected(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            Self::DatadirNotFound => write!(f, "Could not locate the configuration directory."),
            Self::FileNotFound => write!(f, "Could not locate the configuration file."),
            Self::ReadingFile(e) => write!(f, "Failed to read configuration file: {}", e),
            Self::Unexpected(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound,
            _ => Self::ReadingFile(e.to_string()),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Get the absolute path to the cosigner configuration folder.
///
/// It's a "Cosigner/" directory in the XDG standard configuration directory for all OSes but
/// Linux-based ones, for which it's `~/.cosigner/`. The stored keys, wallets and PSBTs live in a
/// per-network subdirectory.
pub fn config_folder_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    let configs_dir = dirs::home_dir();

    #[cfg(not(target_os = "linux"))]
    let configs_dir = dirs::config_dir();

    if let Some(mut path) = configs_dir {
        #[cfg(target_os = "linux")]
        path.push(".cosigner");

        #[cfg(not(target_os = "linux"))]
        path.push("Cosigner");

        return Some(path);
    }

    None
}

fn config_file_path() -> Option<PathBuf> {
    config_folder_path().map(|mut path| {
        path.push("cosigner.toml");
        path
    })
}

impl Config {
    /// Get our static configuration out of a mandatory configuration file.
    pub fn from_file(custom_path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let config_file = match custom_path {
            Some(path) => path,
            None => config_file_path().ok_or(ConfigError::DatadirNotFound)?,
        };

        let config = toml::from_slice::<Config>(&std::fs::read(config_file)?)
            .map_err(|e| ConfigError::ReadingFile(format!("Parsing configuration file: {}", e)))?;
        config.check()?;

        Ok(config)
    }

    /// Make sure the settings are sane.
    pub fn check(&self) -> Result<(), ConfigError> {
        if let Some(ref data_dir) = self.data_dir {
            if data_dir.as_os_str().is_empty() {
                return Err(ConfigError::Unexpected(
                    "'data_dir' must not be empty".to_string(),
                ));
            }
            if data_dir.is_file() {
                return Err(ConfigError::Unexpected(format!(
                    "data directory '{}' is a file",
                    data_dir.display()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    // Test the format of the configuration file
    #[test]
    fn toml_config() {
        // A valid config
        let toml_str = r#"
            data_dir = "/home/wizardsardine/custom/folder/"
            log_level = "debug"
            network = "testnet"
            "#
        .trim_start()
        .replace("            ", "");
        let config = toml::from_str::<Config>(&toml_str).expect("Deserializing toml_str");
        assert_eq!(config.log_level, log::LevelFilter::Debug);
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(
            config.data_dir(),
            Some(PathBuf::from("/home/wizardsardine/custom/folder/"))
        );
        config.check().unwrap();

        // A valid, round-tripping, config
        {
            let toml_str = r#"
            data_dir = '/home/wizardsardine/custom/folder/'
            log_level = 'TRACE'
            network = 'signet'
            "#
            .trim_start()
            .replace("            ", "");
            let parsed = toml::from_str::<Config>(&toml_str).expect("Deserializing toml_str");
            let serialized = toml::to_string_pretty(&parsed).expect("Serializing to toml");
            assert_eq!(toml_str, serialized);
        }

        // The log level and the data directory are optional
        let toml_str = r#"
            network = "bitcoin"
            "#
        .trim_start()
        .replace("            ", "");
        let config = toml::from_str::<Config>(&toml_str).expect("Deserializing toml_str");
        assert_eq!(config, Config::new(Network::Bitcoin, None));
        assert_eq!(config.log_level, log::LevelFilter::Info);

        // But not the network
        let toml_str = r#"
            log_level = "debug"
            "#
        .trim_start()
        .replace("            ", "");
        toml::from_str::<Config>(&toml_str).expect_err("No network");

        // Invalid log level
        let toml_str = r#"
            log_level = "verbose"
            network = "bitcoin"
            "#
        .trim_start()
        .replace("            ", "");
        toml::from_str::<Config>(&toml_str).expect_err("Invalid log level");
    }

    #[test]
    fn config_from_file() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let conf_path = tmp_dir.path().join("cosigner.toml");

        assert_eq!(
            Config::from_file(Some(conf_path.clone())),
            Err(ConfigError::FileNotFound)
        );

        let mut file = std::fs::File::create(&conf_path).unwrap();
        writeln!(file, "network = \"regtest\"").unwrap();
        writeln!(file, "data_dir = \"{}\"", tmp_dir.path().display()).unwrap();
        drop(file);
        let config = Config::from_file(Some(conf_path.clone())).unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.data_dir(), Some(tmp_dir.path().to_path_buf()));

        // The data directory must not be a file.
        let mut file = std::fs::File::create(&conf_path).unwrap();
        writeln!(file, "network = \"regtest\"").unwrap();
        writeln!(file, "data_dir = \"{}\"", conf_path.display()).unwrap();
        drop(file);
        assert!(matches!(
            Config::from_file(Some(conf_path.clone())),
            Err(ConfigError::Unexpected(_))
        ));

        std::fs::write(&conf_path, "network = 12").unwrap();
        assert!(matches!(
            Config::from_file(Some(conf_path)),
            Err(ConfigError::ReadingFile(_))
        ));
    }

    #[test]
    fn config_directory() {
        let filepath = config_file_path().expect("Getting config file path");

        #[cfg(target_os = "linux")]
        assert!(filepath.as_path().ends_with(".cosigner/cosigner.toml"));

        #[cfg(target_os = "macos")]
        assert!(filepath
            .as_path()
            .ends_with("Library/Application Support/Cosigner/cosigner.toml"));

        #[cfg(target_os = "windows")]
        assert!(filepath
            .as_path()
            .ends_with(r#"AppData\Roaming\Cosigner\cosigner.toml"#));
    }
}

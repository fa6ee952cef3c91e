use std::{env, ffi::OsString, fs, path::PathBuf};

use anyhow::{Context, Result, anyhow};
use arkdrop_core::DropConfig;
use arkdrop_entities::PeerId;
use serde::{Deserialize, Serialize};

/// Configuration of the CLI, persisted as TOML in:
/// - Linux: $XDG_CONFIG_HOME/arkdrop/config.toml or
///   $HOME/.config/arkdrop/config.toml
/// - macOS: $HOME/Library/Application Support/arkdrop/config.toml
/// - Windows: %APPDATA%\arkdrop\config.toml
///
/// The `[drop]` table holds the coordinator tunables; any key left out keeps
/// its default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub default_receive_dir: Option<String>,
    pub display_name: Option<String>,
    /// Identity of this node, generated on first use.
    pub peer_id: Option<String>,
    pub drop: DropConfig,
}

impl CliConfig {
    fn config_dir() -> Result<PathBuf> {
        platform_dir(CONFIG_ROOTS, &["arkdrop"], |var| env::var_os(var))
            .ok_or_else(|| {
                let vars: Vec<&str> =
                    CONFIG_ROOTS.iter().map(|(var, _)| *var).collect();
                anyhow!(
                    "Unable to determine config directory (missing {})",
                    vars.join("/")
                )
            })
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Loads the configuration, or the defaults if there is no file yet.
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;
        if !config_file.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_file).with_context(|| {
            format!("Failed to read config file: {}", config_file.display())
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: CliConfig =
            toml::from_str(content).context("Failed to parse config file")?;
        config
            .drop
            .validate()
            .context("Invalid [drop] settings")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_dir = Self::config_dir()?;
        let config_file = config_dir.join("config.toml");

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).with_context(|| {
                format!(
                    "Failed to create config directory: {}",
                    config_dir.display()
                )
            })?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;
        fs::write(&config_file, content).with_context(|| {
            format!("Failed to write config file: {}", config_file.display())
        })?;

        Ok(())
    }

    /// The persisted node identity, creating and saving one if needed.
    pub fn peer_id(&mut self) -> Result<PeerId> {
        if let Some(id) = &self.peer_id {
            return Ok(PeerId::from(id.as_str()));
        }
        let id = PeerId::random();
        self.peer_id = Some(id.to_string());
        self.save().context("Failed to persist the node identity")?;
        Ok(id)
    }

    pub fn display_name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| "arkdrop".to_string())
    }

    /// Saved receive directory, or the platform fallback.
    pub fn receive_dir(&self) -> PathBuf {
        match &self.default_receive_dir {
            Some(dir) => PathBuf::from(dir),
            None => default_receive_dir_fallback(),
        }
    }
}

/// Returns the saved default receive directory, if any.
pub fn get_default_receive_dir() -> Result<Option<String>> {
    Ok(CliConfig::load()?.default_receive_dir)
}

pub fn set_default_receive_dir(dir: String) -> Result<()> {
    let mut config = CliConfig::load()?;
    config.default_receive_dir = Some(dir);
    config.save()
}

pub fn clear_default_receive_dir() -> Result<()> {
    let mut config = CliConfig::load()?;
    config.default_receive_dir = None;
    config.save()
}

/// Where files land when no directory was configured:
/// - Linux/macOS: $HOME/Downloads/Drop
/// - Windows: %USERPROFILE%\Downloads\Drop
pub fn default_receive_dir_fallback() -> PathBuf {
    platform_dir(HOME_ROOTS, &["Downloads", "Drop"], |var| env::var_os(var))
        .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Environment variables that may hold a base directory, each with the
/// subpath to append, in order of preference.
type Roots = &'static [(&'static str, &'static [&'static str])];

#[cfg(target_os = "windows")]
const CONFIG_ROOTS: Roots = &[("APPDATA", &[]), ("USERPROFILE", &[".config"])];
#[cfg(target_os = "macos")]
const CONFIG_ROOTS: Roots = &[("HOME", &["Library", "Application Support"])];
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const CONFIG_ROOTS: Roots = &[("XDG_CONFIG_HOME", &[]), ("HOME", &[".config"])];

#[cfg(target_os = "windows")]
const HOME_ROOTS: Roots = &[("USERPROFILE", &[])];
#[cfg(not(target_os = "windows"))]
const HOME_ROOTS: Roots = &[("HOME", &[])];

/// First root whose variable is set and non-empty, joined with its subpath
/// and then `leaf`.
fn platform_dir(
    roots: Roots,
    leaf: &[&str],
    lookup: impl Fn(&str) -> Option<OsString>,
) -> Option<PathBuf> {
    roots.iter().find_map(|(var, subpath)| {
        let base = lookup(*var).filter(|value| !value.is_empty())?;
        let mut dir = PathBuf::from(base);
        dir.extend(subpath.iter().chain(leaf));
        Some(dir)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = CliConfig::parse("").unwrap();
        assert_eq!(config, CliConfig::default());
        assert_eq!(config.display_name(), "arkdrop");
    }

    #[test]
    fn drop_table_overrides_single_keys() {
        let config = CliConfig::parse(
            r#"
            display_name = "Laptop"
            default_receive_dir = "/srv/drops"

            [drop]
            pending_timeout_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.display_name(), "Laptop");
        assert_eq!(config.receive_dir(), PathBuf::from("/srv/drops"));
        assert_eq!(config.drop.pending_timeout_ms, 5000);
        assert_eq!(config.drop.chunk_size, DropConfig::default().chunk_size);
    }

    #[test]
    fn invalid_drop_settings_are_rejected() {
        let err = CliConfig::parse("[drop]\nchunk_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("Invalid [drop] settings"));
    }

    #[test]
    fn platform_dir_takes_the_first_set_variable() {
        let roots: Roots = &[("PRIMARY", &[]), ("FALLBACK", &[".config"])];
        let only = |set: &'static str, value: &'static str| {
            move |var: &str| (var == set).then(|| OsString::from(value))
        };

        assert_eq!(
            platform_dir(roots, &["arkdrop"], only("PRIMARY", "/xdg")),
            Some(PathBuf::from("/xdg/arkdrop"))
        );
        assert_eq!(
            platform_dir(roots, &["arkdrop"], only("FALLBACK", "/home/me")),
            Some(PathBuf::from("/home/me/.config/arkdrop"))
        );
        assert_eq!(
            platform_dir(roots, &["arkdrop"], only("PRIMARY", "")),
            None
        );
        assert_eq!(platform_dir(roots, &["arkdrop"], |_| None), None);
    }

    #[test]
    fn saved_config_reads_back() {
        let config = CliConfig {
            default_receive_dir: Some("/tmp/in".to_string()),
            display_name: Some("Desk".to_string()),
            peer_id: Some("node-1".to_string()),
            drop: DropConfig::low_bandwidth(),
        };
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(CliConfig::parse(&text).unwrap(), config);
    }
}

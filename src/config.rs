use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// SQLite file holding cache saves (defaults to `<data_dir>/ldc/cache.db`)
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub collections: BTreeMap<String, CollectionConfig>,
  #[serde(default)]
  pub log: LogConfig,
}

/// A remote paginated JSON endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionConfig {
  pub url: String,
  /// Query parameter carrying the page number
  #[serde(default = "default_page_param")]
  pub page_param: String,
  /// Number of the first page, usually 0 or 1
  #[serde(default)]
  pub first_page: u32,
  /// JSON field used as item identity. Whole items are compared when unset.
  pub key_field: Option<String>,
  pub description: Option<String>,
}

fn default_page_param() -> String {
  "page".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Directory for log files (defaults to `<data_dir>/ldc`)
  pub directory: Option<PathBuf>,
  /// Filter directives, overridden by `LDC_LOG`
  pub filter: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ldc.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ldc/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/ldc/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("ldc.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ldc").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    for (name, collection) in &config.collections {
      url::Url::parse(&collection.url)
        .map_err(|e| eyre!("Collection {} has an invalid url: {}", name, e))?;
    }

    Ok(config)
  }

  pub fn collection(&self, name: &str) -> Result<&CollectionConfig> {
    self.collections.get(name).ok_or_else(|| {
      let known: Vec<&str> = self.collections.keys().map(String::as_str).collect();
      eyre!(
        "Unknown collection {}. Configured: {}",
        name,
        known.join(", ")
      )
    })
  }

  /// Default directory for the database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("ldc"))
  }

  /// Bearer token for collection endpoints, from `LDC_API_TOKEN`.
  pub fn get_api_token() -> Option<String> {
    std::env::var("LDC_API_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_defaults() {
    let config = Config::parse(
      r#"
collections:
  watching:
    url: https://api.example.com/v0/collections/watching
"#,
    )
    .unwrap();

    let watching = config.collection("watching").unwrap();
    assert_eq!(watching.page_param, "page");
    assert_eq!(watching.first_page, 0);
    assert!(watching.key_field.is_none());
    assert!(config.database.is_none());
    assert!(config.log.filter.is_none());
  }

  #[test]
  fn test_parse_full() {
    let config = Config::parse(
      r#"
database: /tmp/ldc-test.db
collections:
  done:
    url: https://api.example.com/collections
    page_param: offset_page
    first_page: 1
    key_field: subject_id
    description: finished subjects
log:
  directory: /tmp/ldc-logs
  filter: lazy_data_cache=debug
"#,
    )
    .unwrap();

    assert_eq!(config.database, Some(PathBuf::from("/tmp/ldc-test.db")));
    let done = config.collection("done").unwrap();
    assert_eq!(done.page_param, "offset_page");
    assert_eq!(done.first_page, 1);
    assert_eq!(done.key_field.as_deref(), Some("subject_id"));
    assert_eq!(done.description.as_deref(), Some("finished subjects"));
    assert_eq!(config.log.filter.as_deref(), Some("lazy_data_cache=debug"));
  }

  #[test]
  fn test_invalid_url_rejected() {
    let result = Config::parse(
      r#"
collections:
  broken:
    url: not a url
"#,
    );
    assert!(result.is_err());
  }

  #[test]
  fn test_unknown_collection_lists_known() {
    let config = Config::parse(
      r#"
collections:
  watching:
    url: https://api.example.com/watching
"#,
    )
    .unwrap();

    let err = config.collection("dropped").unwrap_err().to_string();
    assert!(err.contains("dropped"));
    assert!(err.contains("watching"));
  }

  #[test]
  fn test_missing_explicit_path() {
    let result = Config::load(Some(Path::new("/nonexistent/ldc.yaml")));
    assert!(result.is_err());
  }
}

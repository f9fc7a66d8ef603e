//! Debug session settings
//!
//! Settings normally come from the document being debugged; the command line controller loads
//! them from a TOML file instead:
//!
//! ```toml
//! hostname = "build-box.local"
//! port = 12345
//! run_in_editor = false
//! language = "C++"
//! ```

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use eyre::Context;
use serde::{Deserialize, Serialize};

/// The port debug servers listen on unless configured otherwise
pub const DEFAULT_PORT: u16 = 12345;

/// Where and how to reach the engine executing the petri net
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    pub hostname: String,
    pub port: u16,
    /// Load the compiled petri net into this process and host the debug server here, instead
    /// of attaching to a separately running engine
    pub run_in_editor: bool,
    pub language: Language,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: DEFAULT_PORT,
            run_in_editor: false,
            language: Language::default(),
        }
    }
}

/// Target language the petri net is generated in
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "C++")]
    Cpp,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "C#")]
    CSharp,
    #[serde(rename = "Python")]
    Python,
}

impl Language {
    /// Name of the language as sent on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Cpp => "C++",
            Language::C => "C",
            Language::CSharp => "C#",
            Language::Python => "Python",
        }
    }

    /// File extension of generated source files, including the dot
    pub fn source_extension(&self) -> &'static str {
        match self {
            Language::Cpp => ".cpp",
            Language::C => ".c",
            Language::CSharp => ".cs",
            Language::Python => ".py",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c++" | "cpp" => Ok(Self::Cpp),
            "c" => Ok(Self::C),
            "c#" | "csharp" => Ok(Self::CSharp),
            "python" => Ok(Self::Python),
            other => Err(eyre::eyre!("invalid language {other}")),
        }
    }
}

/// Default location of the settings file
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("petri-debug").join("settings.toml"))
}

pub fn load(contents: &str) -> eyre::Result<DebugSettings> {
    toml::from_str(contents).context("parsing debug settings")
}

pub fn load_from(path: impl AsRef<Path>) -> eyre::Result<DebugSettings> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings file {}", path.display()))?;
    load(&contents).with_context(|| format!("loading settings from {}", path.display()))
}

/// Load settings from `path`, or from [`default_path`] if none is given, falling back to the
/// defaults when the file does not exist
pub fn load_or_default(path: Option<&Path>) -> eyre::Result<DebugSettings> {
    let path = match path.map(Path::to_path_buf).or_else(default_path) {
        Some(path) => path,
        None => {
            tracing::warn!("cannot determine configuration directory, using default settings");
            return Ok(DebugSettings::default());
        }
    };

    if !path.is_file() {
        tracing::debug!(path = %path.display(), "no settings file, using defaults");
        return Ok(DebugSettings::default());
    }
    load_from(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings = load("port = 4000").unwrap();
        assert_eq!(
            settings,
            DebugSettings {
                port: 4000,
                ..Default::default()
            }
        );
    }

    #[test]
    fn full_settings() {
        let settings = load(
            r#"
            hostname = "10.0.0.2"
            port = 5000
            run_in_editor = true
            language = "C#"
            "#,
        )
        .unwrap();

        assert_eq!(settings.hostname, "10.0.0.2");
        assert_eq!(settings.port, 5000);
        assert!(settings.run_in_editor);
        assert_eq!(settings.language, Language::CSharp);
    }

    #[test]
    fn unknown_language_is_an_error() {
        assert!(load(r#"language = "COBOL""#).is_err());
    }

    #[test]
    fn language_wire_names() {
        for language in [Language::Cpp, Language::C, Language::CSharp, Language::Python] {
            assert_eq!(language.as_str().parse::<Language>().unwrap(), language);
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_or_default(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings, DebugSettings::default());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "hostname = \"engine\"\n").unwrap();

        let settings = load_or_default(Some(&path)).unwrap();
        assert_eq!(settings.hostname, "engine");
        assert_eq!(settings.port, DEFAULT_PORT);
    }
}

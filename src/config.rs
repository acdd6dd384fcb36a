// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use winit::keyboard::KeyCode;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub assets: AssetConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Quad Renderer".to_string(),
            width: 1080,
            height: 900,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Paths to the precompiled shaders and the texture
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub texture: PathBuf,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            vertex_shader: PathBuf::from("shaders/quad.vert.spv"),
            fragment_shader: PathBuf::from("shaders/quad.frag.spv"),
            texture: PathBuf::from("textures/texture.png"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    pub hot_reload: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
            show_fps: true,
            hot_reload: false,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            quit_key: "Escape".to_string(),
        }
    }
}

impl ControlsConfig {
    pub fn fullscreen(&self) -> KeyCode {
        parse_key(&self.fullscreen_key).unwrap_or_else(|| {
            log::warn!("Unknown fullscreen key '{}', defaulting to F11", self.fullscreen_key);
            KeyCode::F11
        })
    }

    pub fn quit(&self) -> KeyCode {
        parse_key(&self.quit_key).unwrap_or_else(|| {
            log::warn!("Unknown quit key '{}', defaulting to Escape", self.quit_key);
            KeyCode::Escape
        })
    }
}

/// Map a key name from the config file to a physical key code.
fn parse_key(name: &str) -> Option<KeyCode> {
    let key = match name.to_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "space" => KeyCode::Space,
        "enter" | "return" => KeyCode::Enter,
        "tab" => KeyCode::Tab,
        "q" => KeyCode::KeyQ,
        "f" => KeyCode::KeyF,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f5" => KeyCode::F5,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        _ => return None,
    };
    Some(key)
}

/// Where the active configuration came from
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    Missing(PathBuf),
    /// The file exists but could not be used; defaults were substituted
    Broken(anyhow::Error),
}

impl ConfigSource {
    /// Report the outcome once a logger is installed
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => log::info!("Loaded configuration from {:?}", path),
            ConfigSource::Missing(path) => log::info!("Config file not found at {:?}, using defaults", path),
            ConfigSource::Broken(e) => log::warn!("{:#}. Using defaults.", e),
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults if it is
    /// missing or broken. Nothing is logged here since this runs before
    /// the logger is set up.
    pub fn load<P: AsRef<Path>>(path: P) -> (Self, ConfigSource) {
        let path = path.as_ref();

        if !path.exists() {
            return (Config::default(), ConfigSource::Missing(path.to_path_buf()));
        }

        match Self::load_from_path(path) {
            Ok(config) => (config, ConfigSource::File(path.to_path_buf())),
            Err(e) => (Config::default(), ConfigSource::Broken(e)),
        }
    }

    /// Read and parse a specific file
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validation layers are only ever enabled in debug builds
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 1080);
        assert_eq!(config.window.height, 900);
        assert_eq!(config.assets.vertex_shader, PathBuf::from("shaders/quad.vert.spv"));
        assert_eq!(config.assets.texture, PathBuf::from("textures/texture.png"));
        assert!(!config.debug.hot_reload);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::parse(
            r#"
            [window]
            width = 640

            [assets]
            texture = "other.png"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 900);
        assert_eq!(config.window.title, "Quad Renderer");
        assert_eq!(config.assets.texture, PathBuf::from("other.png"));
        assert_eq!(config.assets.fragment_shader, PathBuf::from("shaders/quad.frag.spv"));
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(Config::parse("[window\nwidth = ").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let (config, source) = Config::load("definitely/not/here.toml");
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert!(matches!(source, ConfigSource::Missing(_)));
    }

    #[test]
    fn broken_file_falls_back_to_defaults_and_keeps_the_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[window]\nwidth = \"wide\"\n").unwrap();

        let (config, source) = Config::load(&path);

        assert_eq!(config.window.width, 1080);
        assert_eq!(config.assets.texture, PathBuf::from("textures/texture.png"));
        match source {
            ConfigSource::Broken(e) => assert!(format!("{:#}", e).contains("Failed to parse config file")),
            other => panic!("expected a broken config, got {:?}", other),
        }
    }

    #[test]
    fn existing_file_is_used() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[window]\nwidth = 640\n").unwrap();

        let (config, source) = Config::load(&path);

        assert_eq!(config.window.width, 640);
        assert!(matches!(source, ConfigSource::File(p) if p == path));
    }

    #[test]
    fn key_names_are_case_insensitive() {
        let controls = ControlsConfig {
            fullscreen_key: "f".to_string(),
            quit_key: "ESC".to_string(),
        };
        assert_eq!(controls.fullscreen(), KeyCode::KeyF);
        assert_eq!(controls.quit(), KeyCode::Escape);
    }

    #[test]
    fn unknown_key_names_fall_back() {
        let controls = ControlsConfig {
            fullscreen_key: "hyper".to_string(),
            quit_key: "meta".to_string(),
        };
        assert_eq!(controls.fullscreen(), KeyCode::F11);
        assert_eq!(controls.quit(), KeyCode::Escape);
    }
}

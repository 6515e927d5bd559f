// Configuration - load settings from config.toml
//
// Every table and field is optional; missing pieces fall back to defaults so
// a missing or partial config file is never fatal.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::frame::DEFAULT_FRAMES_IN_FLIGHT;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Spark Renderer".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub frames_in_flight: usize,
    /// Gradient endpoints of the background pass, RGBA in 0-1 range.
    pub background_top_color: [f32; 4],
    pub background_bottom_color: [f32; 4],
    /// Path to the background shader: a .spv file, or a directory containing
    /// exactly one.
    pub shader: PathBuf,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            background_top_color: [0.1, 0.2, 0.8, 1.0],
            background_bottom_color: [0.0, 0.0, 0.1, 1.0],
            shader: PathBuf::from("shaders/gradient.comp.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_a_usable_engine() {
        let config = Config::default();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(
            config.graphics.shader,
            PathBuf::from("shaders/gradient.comp.spv")
        );
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_tables() {
        let config: Config = toml::from_str(
            r#"
            [window]
            title = "Custom"
            width = 800
            "#,
        )
        .unwrap();

        assert_eq!(config.window.title, "Custom");
        assert_eq!(config.window.width, 800);
        // Unset fields and tables keep their defaults
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn graphics_table_parses_colors_and_shader_path() {
        let config: Config = toml::from_str(
            r#"
            [graphics]
            frames_in_flight = 3
            background_top_color = [1.0, 0.0, 0.0, 1.0]
            shader = "shaders"
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.frames_in_flight, 3);
        assert_eq!(config.graphics.background_top_color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.graphics.shader, PathBuf::from("shaders"));
        // Untouched color keeps its default
        assert_eq!(
            config.graphics.background_bottom_color,
            [0.0, 0.0, 0.1, 1.0]
        );
    }
}

// =============================================================================
// CONFIGURATION - Load device settings from rhi.toml
// =============================================================================
//
// Every section has defaults, so a missing file or a missing key never stops
// a device from coming up.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Which native API backs the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Vulkan,
    Software,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Vulkan => "vulkan",
            BackendKind::Software => "software",
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "vulkan") {
            BackendKind::Vulkan
        } else {
            BackendKind::Software
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RhiConfig {
    pub device: DeviceConfig,
    pub debug: DebugConfig,
    pub swapchain: SwapchainConfig,
    pub limits: LimitsConfig,
}

/// Device selection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    pub app_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            app_name: "rhi".to_string(),
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Request VK_LAYER_KHRONOS_validation (debug builds only).
    pub validation_layers: bool,
    /// Replay every submitted list against the resource-state ledger.
    pub state_validation: bool,
    /// Record draws and dispatches on the software backend.
    pub capture_draws: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            state_validation: cfg!(debug_assertions),
            capture_draws: true,
        }
    }
}

/// Presentation settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwapchainConfig {
    pub present_mode: String,
    pub image_count: u32,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            image_count: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_command_lists_per_storage: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_command_lists_per_storage: 64 }
    }
}

/// Presentation pacing, independent of any backend enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

impl RhiConfig {
    /// Load configuration from rhi.toml, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("rhi.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load rhi.toml: {:#}. Using defaults.", e);
            RhiConfig::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(RhiConfig::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Shorthand for a default config on the given backend.
    pub fn with_backend(backend: BackendKind) -> Self {
        let mut config = RhiConfig::default();
        config.device.backend = backend;
        config
    }

    /// Get the requested present mode
    pub fn present_mode(&self) -> PresentMode {
        match self.swapchain.present_mode.to_lowercase().as_str() {
            "immediate" => PresentMode::Immediate,
            "mailbox" => PresentMode::Mailbox,
            "fifo" => PresentMode::Fifo,
            "fifo_relaxed" => PresentMode::FifoRelaxed,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.swapchain.present_mode
                );
                PresentMode::Fifo
            }
        }
    }

    pub(crate) fn validation_layers_enabled(&self) -> bool {
        self.debug.validation_layers && cfg!(debug_assertions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = RhiConfig::from_toml_str(
            r#"
            [device]
            backend = "software"

            [swapchain]
            image_count = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.device.backend, BackendKind::Software);
        assert_eq!(config.device.app_name, "rhi");
        assert_eq!(config.swapchain.image_count, 2);
        assert_eq!(config.present_mode(), PresentMode::Fifo);
        assert_eq!(config.limits.max_command_lists_per_storage, 64);
    }

    #[test]
    fn unknown_present_mode_defaults_to_fifo() {
        let mut config = RhiConfig::default();
        config.swapchain.present_mode = "vsync-ish".into();
        assert_eq!(config.present_mode(), PresentMode::Fifo);
        config.swapchain.present_mode = "Mailbox".into();
        assert_eq!(config.present_mode(), PresentMode::Mailbox);
    }

    #[test]
    fn unknown_backend_is_a_parse_error() {
        assert!(RhiConfig::from_toml_str("[device]\nbackend = \"metal\"").is_err());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = RhiConfig::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.debug.state_validation, cfg!(debug_assertions));
    }
}

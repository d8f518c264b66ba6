// config.rs

use crate::bridge::{BridgeOptions, StartRequest};
use crate::ump::LocalFormat;
use config::{Config, Environment, File};
use log::debug;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "UMPBRIDGE";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("no {0} port selected")]
    MissingPort(&'static str),
    #[error("UMP group {0} out of range (0-15)")]
    InvalidGroup(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceSettings {
    /// Index of the port the bridge reads from
    pub output_port: Option<usize>,
    /// Index of the port the bridge writes to
    pub input_port: Option<usize>,
    pub inbound_format: LocalFormat,
    pub outbound_format: LocalFormat,
    pub group: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkSettings {
    pub host: String,
    pub port: u16,
    pub local_port: u16,
    pub endpoint_name: String,
    pub initiator: bool,
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeSettings {
    pub poll_interval_ms: u64,
    pub join_timeout_ms: u64,
}

/// Fully layered application settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub log_level: String,
    pub device: DeviceSettings,
    pub network: NetworkSettings,
    pub bridge: BridgeSettings,
}

/// Values given on the command line; they win over every other layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub output_port: Option<usize>,
    pub input_port: Option<usize>,
    pub endpoint_name: Option<String>,
    pub log_level: Option<String>,
    pub responder: bool,
}

impl Settings {
    /// Layers built-in defaults, the optional TOML file, `UMPBRIDGE_*` environment variables
    /// and the command line overrides.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self, SettingsError> {
        Self::load_with_prefix(path, overrides, ENV_PREFIX)
    }

    fn load_with_prefix(
        path: Option<&Path>,
        overrides: &Overrides,
        env_prefix: &str,
    ) -> Result<Self, SettingsError> {
        let mut builder = Config::builder()
            .set_default("log_level", "info")?
            .set_default("device.inbound_format", "midi1")?
            .set_default("device.outbound_format", "ump")?
            .set_default("device.group", 0i64)?
            .set_default("network.host", "127.0.0.1")?
            .set_default("network.port", 5504i64)?
            .set_default("network.local_port", 5504i64)?
            .set_default("network.endpoint_name", "UMP Bridge")?
            .set_default("network.initiator", true)?
            .set_default("network.handshake_timeout_ms", 5000i64)?
            .set_default("bridge.poll_interval_ms", 1i64)?
            .set_default("bridge.join_timeout_ms", 2000i64)?;

        if let Some(path) = path {
            debug!("Loading settings from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("network.host", overrides.host.clone())?
            .set_override_option("network.port", overrides.port.map(i64::from))?
            .set_override_option(
                "device.output_port",
                overrides.output_port.map(|p| p as i64),
            )?
            .set_override_option("device.input_port", overrides.input_port.map(|p| p as i64))?
            .set_override_option("network.endpoint_name", overrides.endpoint_name.clone())?
            .set_override_option("log_level", overrides.log_level.clone())?;
        if overrides.responder {
            builder = builder.set_override("network.initiator", false)?;
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        if settings.device.group > 0x0F {
            return Err(SettingsError::InvalidGroup(settings.device.group));
        }
        debug!("Effective settings: {:?}", settings);
        Ok(settings)
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            poll_interval: Duration::from_millis(self.bridge.poll_interval_ms.max(1)),
            join_timeout: Duration::from_millis(self.bridge.join_timeout_ms),
            handshake_timeout: Duration::from_millis(self.network.handshake_timeout_ms),
            inbound_format: self.device.inbound_format,
            outbound_format: self.device.outbound_format,
            group: self.device.group,
            local_port: self.network.local_port,
            initiator: self.network.initiator,
            ..BridgeOptions::default()
        }
    }

    /// Builds the start request; both device ports must be selected by now.
    pub fn start_request(&self) -> Result<StartRequest, SettingsError> {
        Ok(StartRequest {
            output_port: self
                .device
                .output_port
                .ok_or(SettingsError::MissingPort("output"))?,
            input_port: self
                .device
                .input_port
                .ok_or(SettingsError::MissingPort("input"))?,
            host: self.network.host.clone(),
            port: self.network.port,
            endpoint_name: self.network.endpoint_name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const TEST_PREFIX: &str = "UMPBRIDGE_UNIT_TEST";

    #[test]
    fn test_defaults() {
        let settings =
            Settings::load_with_prefix(None, &Overrides::default(), TEST_PREFIX).unwrap();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.network.host, "127.0.0.1");
        assert_eq!(settings.network.port, 5504);
        assert!(settings.network.initiator);
        assert_eq!(settings.device.inbound_format, LocalFormat::Midi1);
        assert_eq!(settings.device.outbound_format, LocalFormat::Ump);
        assert_eq!(settings.device.output_port, None);

        let options = settings.bridge_options();
        assert_eq!(options.poll_interval, Duration::from_millis(1));
        assert_eq!(options.join_timeout, Duration::from_secs(2));
        assert_eq!(options.product_instance_id, "UMPB_001");
    }

    #[test]
    fn test_file_then_cli_overrides() {
        let path = std::env::temp_dir().join(format!("umpbridge-test-{}.toml", std::process::id()));
        fs::write(
            &path,
            "[network]\nhost = \"10.0.0.7\"\nendpoint_name = \"From File\"\n\n[device]\noutput_port = 2\noutbound_format = \"midi1\"\n",
        )
        .unwrap();

        let overrides = Overrides {
            endpoint_name: Some("TestEndpoint".into()),
            input_port: Some(1),
            responder: true,
            ..Overrides::default()
        };
        let settings = Settings::load_with_prefix(Some(&path), &overrides, TEST_PREFIX).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(settings.network.host, "10.0.0.7");
        assert_eq!(settings.network.endpoint_name, "TestEndpoint");
        assert_eq!(settings.device.outbound_format, LocalFormat::Midi1);
        assert!(!settings.network.initiator);

        let request = settings.start_request().unwrap();
        assert_eq!(request.output_port, 2);
        assert_eq!(request.input_port, 1);
        assert_eq!(request.port, 5504);
    }

    #[test]
    fn test_environment_layer() {
        std::env::set_var("UMPBRIDGE_ENV_TEST_NETWORK__PORT", "6000");
        let settings =
            Settings::load_with_prefix(None, &Overrides::default(), "UMPBRIDGE_ENV_TEST").unwrap();
        assert_eq!(settings.network.port, 6000);

        let overrides = Overrides {
            port: Some(7000),
            ..Overrides::default()
        };
        let settings =
            Settings::load_with_prefix(None, &overrides, "UMPBRIDGE_ENV_TEST").unwrap();
        assert_eq!(settings.network.port, 7000);
    }

    #[test]
    fn test_missing_port() {
        let settings =
            Settings::load_with_prefix(None, &Overrides::default(), TEST_PREFIX).unwrap();
        assert!(matches!(
            settings.start_request(),
            Err(SettingsError::MissingPort("output"))
        ));
    }
}

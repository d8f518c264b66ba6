use crate::config::Overrides;
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Select};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Bridges a local MIDI port to a Network MIDI 2.0 session", long_about = None)]
pub struct Args {
    /// List available MIDI ports and exit
    #[arg(long)]
    pub list_ports: bool,

    /// TOML settings file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Remote host of the network session
    #[arg(long)]
    pub host: Option<String>,

    /// Remote UDP port of the network session
    #[arg(long)]
    pub port: Option<u16>,

    /// Index of the MIDI port to read from
    #[arg(long, value_name = "INDEX")]
    pub output_port: Option<usize>,

    /// Index of the MIDI port to write to
    #[arg(long, value_name = "INDEX")]
    pub input_port: Option<usize>,

    /// Endpoint name announced to the peer
    #[arg(long)]
    pub endpoint_name: Option<String>,

    /// Terminal log level (error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Wait for an invitation instead of sending one
    #[arg(long)]
    pub responder: bool,
}

impl Args {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            port: self.port,
            output_port: self.output_port,
            input_port: self.input_port,
            endpoint_name: self.endpoint_name.clone(),
            log_level: self.log_level.clone(),
            responder: self.responder,
        }
    }
}

pub fn validate_port(kind: &str, index: usize, ports: &[String]) -> Result<(), String> {
    if index >= ports.len() {
        let mut error_msg = format!(
            "Error: {} port {} not found in available ports:\n",
            kind, index
        );
        for (i, port) in ports.iter().enumerate() {
            error_msg.push_str(&format!("  {}: {}\n", i, port));
        }
        return Err(error_msg);
    }
    Ok(())
}

/// Asks the user to pick one of `ports` on the terminal.
pub fn prompt_port(kind: &str, ports: &[String]) -> dialoguer::Result<usize> {
    Select::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Select the MIDI {} port", kind))
        .items(ports)
        .default(0)
        .interact()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_to_overrides() {
        let args = Args::parse_from([
            "umpbridge",
            "--host",
            "192.168.1.20",
            "--output-port",
            "1",
            "--endpoint-name",
            "TestEndpoint",
            "--responder",
        ]);
        let overrides = args.overrides();
        assert_eq!(overrides.host.as_deref(), Some("192.168.1.20"));
        assert_eq!(overrides.output_port, Some(1));
        assert_eq!(overrides.input_port, None);
        assert_eq!(overrides.endpoint_name.as_deref(), Some("TestEndpoint"));
        assert!(overrides.responder);
    }

    #[test]
    fn test_validate_port() {
        let ports = vec!["Synth A".to_string(), "Synth B".to_string()];
        assert!(validate_port("output", 1, &ports).is_ok());

        let err = validate_port("output", 2, &ports).unwrap_err();
        assert!(err.contains("output port 2 not found"));
        assert!(err.contains("1: Synth B"));
    }
}

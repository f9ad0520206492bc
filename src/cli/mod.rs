mod profiles;
mod serve;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::core::config::RelayConfig;
use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Commands")
        .command("serve", "Start the relay (HTTP API, websocket sessions, log stream)")
        .command("profiles", "List the profiles the relay would load")
        .command("check <profile>", "Refresh a token and probe the desk API for one profile")
        .command("help", "Show this help")
        .print();

    GuideSection::new("Options")
        .command("--config <path>", "Relay config file (default: ./relay.toml)")
        .command("--host <addr>", "Bind address (default: 127.0.0.1)")
        .command("--port <port>", "Bind port (default: 3000, 0 picks a free port)")
        .command("--profiles <path>", "Profile list JSON (default: ./profiles.json)")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("desk-relay").green()
    );
}

/// Flags shared by every command that loads relay settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ServeFlags {
    pub config: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub profiles: Option<PathBuf>,
    /// Arguments that are not flags, in order.
    pub positional: Vec<String>,
}

impl ServeFlags {
    /// Flags win over the config file.
    pub(crate) fn apply(&self, config: &mut RelayConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = &self.profiles {
            config.server.profiles_path = path.clone();
        }
    }

    pub(crate) async fn load_config(&self) -> Result<RelayConfig> {
        let mut config = RelayConfig::load(self.config.as_deref()).await?;
        self.apply(&mut config);
        Ok(config)
    }
}

pub(crate) fn parse_serve_flags(args: &[String], start: usize) -> Result<ServeFlags> {
    let mut flags = ServeFlags::default();
    let mut i = start;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = args.get(i + 1);
        match (flag, value) {
            ("--config" | "-c", Some(v)) => flags.config = Some(PathBuf::from(v)),
            ("--host", Some(v)) => flags.host = Some(v.clone()),
            ("--port" | "-p", Some(v)) => {
                flags.port = Some(
                    v.parse()
                        .map_err(|_| anyhow::anyhow!("Invalid port '{}'", v))?,
                )
            }
            ("--profiles", Some(v)) => flags.profiles = Some(PathBuf::from(v)),
            ("--config" | "-c" | "--host" | "--port" | "-p" | "--profiles", None) => {
                anyhow::bail!("Missing value for {}", flag);
            }
            _ => {
                flags.positional.push(args[i].clone());
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    Ok(flags)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("help");

    match cmd {
        "serve" => {
            let flags = parse_serve_flags(&args, 2)?;
            serve::run_server(flags).await
        }
        "profiles" => {
            let flags = parse_serve_flags(&args, 2)?;
            profiles::list_profiles(flags).await
        }
        "check" => {
            let flags = parse_serve_flags(&args, 2)?;
            profiles::check_profile(flags).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "--version" | "-V" => {
            println!("desk-relay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command '{}'.", other));
            print_help();
            Ok(())
        }
    }
}

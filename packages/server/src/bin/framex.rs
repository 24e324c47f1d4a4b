//! `framex` command-line entry point.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use framex_server::config::{AdapterMode, Settings};
use framex_server::logging::init_logging;
use framex_server::plugin::ModuleCatalog;
use framex_server::runtime;

#[derive(Parser)]
#[command(name = "framex", version, about = "Plugin host exposing plugin operations over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the configured plugins and serve them.
    Run(RunArgs),
    /// List the plugin modules this build can load.
    Plugins,
}

#[derive(Args)]
struct RunArgs {
    /// TOML settings file.
    #[arg(long, env = "FRAMEX_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "FRAMEX_HOST")]
    host: Option<String>,

    #[arg(long, env = "FRAMEX_PORT")]
    port: Option<u16>,

    #[arg(long, value_enum, env = "FRAMEX_MODE")]
    mode: Option<AdapterMode>,

    /// External plugin modules or packages, comma separated.
    #[arg(long, env = "FRAMEX_LOAD_PLUGINS", value_delimiter = ',')]
    load_plugins: Vec<String>,

    /// Built-in plugin names, comma separated.
    #[arg(long, env = "FRAMEX_LOAD_BUILTIN_PLUGINS", value_delimiter = ',')]
    load_builtin_plugins: Vec<String>,

    /// Forward unresolved remote APIs through the proxy plugin.
    #[arg(long, env = "FRAMEX_ENABLE_PROXY")]
    enable_proxy: bool,
}

impl RunArgs {
    /// File settings (or defaults) with command-line values applied on top.
    fn settings(self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(mode) = self.mode {
            settings.server.mode = mode;
        }
        if !self.load_plugins.is_empty() {
            settings.load_plugins = self.load_plugins;
        }
        if !self.load_builtin_plugins.is_empty() {
            settings.load_builtin_plugins = self.load_builtin_plugins;
        }
        settings.enable_proxy |= self.enable_proxy;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Run(args) => {
            let settings = args.settings()?;
            init_logging(&settings.log)?;
            runtime::run(settings).await
        }
        Command::Plugins => {
            for name in ModuleCatalog::with_builtins().module_names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

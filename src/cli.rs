use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::broker::{DEFAULT_PLATFORM_NAME, ServeConfig};
use crate::engine::EngineConfig;

#[derive(Parser)]
#[command(name = "interopd", about = "Interop intent resolution and routing broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the broker daemon
    Serve(ServeArgs),

    /// One-shot broker commands
    Client {
        /// Broker socket (default: $XDG_RUNTIME_DIR/interop/broker.sock)
        #[arg(long, global = true)]
        socket: Option<PathBuf>,

        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path (default: $XDG_RUNTIME_DIR/interop/broker.sock)
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// App Directory JSON file
    #[arg(long)]
    pub directory: Option<PathBuf>,

    /// Name of the broker's own platform
    #[arg(long, default_value = DEFAULT_PLATFORM_NAME)]
    pub platform_name: String,

    /// Per-platform resolution timeout
    #[arg(long, default_value_t = 5_000)]
    pub query_timeout_ms: u64,

    /// How long a launched app has to connect back
    #[arg(long, default_value_t = 30_000)]
    pub launch_timeout_ms: u64,
}

impl ServeArgs {
    /// Daemon settings, with the socket path already resolved.
    pub fn into_config(self, socket_path: PathBuf) -> ServeConfig {
        ServeConfig {
            socket_path,
            platform_name: self.platform_name,
            directory: self.directory,
            engine: EngineConfig {
                query_timeout: Duration::from_millis(self.query_timeout_ms),
                launch_timeout: Duration::from_millis(self.launch_timeout_ms),
                ..EngineConfig::default()
            },
        }
    }
}

/// An application named on the command line.
#[derive(Args, Debug, Clone)]
pub struct AppArg {
    /// App id or name
    pub app: String,

    /// Platform owning the app (default: the broker's)
    #[arg(long)]
    pub platform: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ClientAction {
    /// List connected platforms
    Platforms,

    /// Find handlers for an intent
    Resolve {
        intent: String,

        /// Context as JSON
        #[arg(long)]
        context: Option<String>,
    },

    /// Find intents and handlers for a context
    ResolveContext {
        /// Context as JSON
        context: String,
    },

    /// Raise an intent
    Raise {
        intent: String,

        /// Context as JSON
        context: String,

        /// Deliver to this app instead of resolving
        #[arg(long)]
        app: Option<String>,

        /// Platform of --app
        #[arg(long, requires = "app")]
        platform: Option<String>,

        /// Running instance of --app
        #[arg(long, requires = "app")]
        instance: Option<String>,
    },

    /// Broadcast a context to every listener
    Broadcast {
        /// Context as JSON
        context: String,
    },

    /// Launch an application
    Open {
        #[command(flatten)]
        target: AppArg,

        /// Initial context as JSON
        #[arg(long)]
        context: Option<String>,
    },

    /// List running instances of an application
    Instances {
        #[command(flatten)]
        target: AppArg,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["interopd", "serve"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.into_config(PathBuf::from("/tmp/b.sock"));
        assert_eq!(config.platform_name, DEFAULT_PLATFORM_NAME);
        assert_eq!(config.engine.query_timeout, Duration::from_secs(5));
        assert_eq!(config.engine.launch_timeout, Duration::from_secs(30));
        assert!(config.directory.is_none());
    }

    #[test]
    fn serve_timeouts_in_milliseconds() {
        let cli = Cli::try_parse_from([
            "interopd",
            "serve",
            "--query-timeout-ms",
            "250",
            "--launch-timeout-ms",
            "1000",
            "--platform-name",
            "desk",
        ])
        .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.into_config(PathBuf::from("/tmp/b.sock"));
        assert_eq!(config.engine.query_timeout, Duration::from_millis(250));
        assert_eq!(config.engine.launch_timeout, Duration::from_secs(1));
        assert_eq!(config.platform_name, "desk");
    }

    #[test]
    fn raise_platform_requires_app() {
        let result = Cli::try_parse_from([
            "interopd",
            "client",
            "raise",
            "ViewChart",
            "{}",
            "--platform",
            "A",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn client_socket_after_action() {
        let cli = Cli::try_parse_from(["interopd", "client", "platforms", "--socket", "/tmp/x.sock"])
            .unwrap();
        match cli.command {
            Command::Client { socket, action } => {
                assert_eq!(socket, Some(PathBuf::from("/tmp/x.sock")));
                assert!(matches!(action, ClientAction::Platforms));
            }
            Command::Serve(_) => panic!("expected client"),
        }
    }
}

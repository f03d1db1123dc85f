use std::net::SocketAddr;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use mercury_node::config::Config;
use mercury_node::config::DEFAULT_CONFIG_PATH;
use mercury_node::driver::Driver;
use mercury_node::driver::LoggingApp;
use mercury_node::logging::init_logging;
use mercury_node::logging::LogLevel;

#[derive(Parser, Debug)]
#[command(about, version, author)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value_t = LogLevel::Info, value_enum, env)]
    log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Command {
    #[command(about = "Writes a default node configuration.")]
    Init(InitCommand),
    #[command(about = "Starts a node and keeps it running until interrupted.")]
    Run(RunCommand),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[arg(
        long,
        short = 'c',
        env,
        default_value = DEFAULT_CONFIG_PATH,
        help = "Config file location"
    )]
    pub config: String,
}

#[derive(Args, Debug)]
struct InitCommand {
    #[arg(
        long,
        default_value = DEFAULT_CONFIG_PATH,
        help = "The location of config file"
    )]
    pub location: String,
}

#[derive(Args, Debug)]
struct RunCommand {
    #[command(flatten)]
    config_args: ConfigArgs,

    #[arg(
        long,
        short = 'b',
        help = "UDP listen address. If not provided, use bind in config file",
        env
    )]
    pub bind: Option<SocketAddr>,

    #[arg(
        long,
        help = "Address announced to peers. If not provided, use advertise in config file",
        env
    )]
    pub advertise: Option<SocketAddr>,

    #[arg(
        long,
        help = "Bootstrap server. If not provided, use bootstrap in config file",
        env
    )]
    pub bootstrap: Option<SocketAddr>,
}

impl RunCommand {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = Config::read_fs(self.config_args.config.as_str())?;
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(advertise) = self.advertise {
            config.advertise = Some(advertise);
        }
        if let Some(bootstrap) = self.bootstrap {
            config.bootstrap = Some(bootstrap);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    match cli.command {
        Command::Init(args) => {
            let p = Config::default().write_fs(args.location.as_str())?;
            println!("Your config file has saved to: {}", p);
            Ok(())
        }
        Command::Run(args) => {
            let config = args.load_config()?;
            tracing::debug!("Run with config: {:?}", config);
            let driver = Driver::bind(&config, LoggingApp).await?;
            driver.run().await?;
            Ok(())
        }
    }
}

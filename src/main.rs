use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::{Arc, Weak};

use hesperus::application::services::Core;
use hesperus::infrastructure::adapters::ConsoleTransport;
use hesperus::infrastructure::config::Config;
use hesperus::infrastructure::plugins::PluginLoader;

#[derive(Parser)]
#[command(name = "hesperus")]
#[command(about = "A plugin-driven chat bot", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot on the console
    Run,
    /// Load every configured plugin once and report problems
    CheckConfig,
    /// List the plugin types this build knows about
    ListPlugins,
    /// Generate default config
    InitConfig,
    /// Show version
    Version,
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_bot(&cli.config),
        Commands::CheckConfig => check_config(&cli.config),
        Commands::ListPlugins => {
            list_plugins();
            ExitCode::SUCCESS
        }
        Commands::InitConfig => init_config(),
        Commands::Version => {
            println!("hesperus v{}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

fn run_bot(config_path: &str) -> ExitCode {
    let config = match Config::load_or_default(config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Refusing to start with a broken config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("Starting {}", config.core.name);

    let (core, outbox) = Core::new(&config.core, PluginLoader::default());
    let report = core.load(&config);
    for (type_name, e) in &report.failed {
        tracing::error!("Plugin {} not loaded: {}", type_name, e);
    }

    let transport = Arc::new(ConsoleTransport::new(
        config.core.console_channel.clone(),
        config.core.directed_prefix.clone(),
    ));

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = rt.block_on(async {
        let stopper = Arc::clone(&core);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted");
                stopper.stop();
            }
        });
        Arc::clone(&core).run(transport, outbox).await
    });
    // the console reader may still be parked on stdin
    rt.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Bot stopped with error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn check_config(config_path: &str) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let loader = PluginLoader::default();
    let mut failures = 0;
    for (index, descriptor) in config.descriptors().into_iter().enumerate() {
        let descriptor = match descriptor {
            Ok(d) => d,
            Err(e) => {
                println!("#{}: FAILED {}", index, e);
                failures += 1;
                continue;
            }
        };
        let type_name = descriptor.type_name.clone();
        match loader.load_plugin(Weak::new(), descriptor) {
            Ok(plugin) => println!("#{}: ok {} on {:?}", index, plugin.name(), plugin.agent().channels()),
            Err(e) => {
                println!("#{}: FAILED {}: {}", index, type_name, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn list_plugins() {
    let loader = PluginLoader::default();
    for spec in loader.registry().specs() {
        println!("{}", spec.type_name);
        println!("    {}", spec.summary);
        for kw in spec.keywords {
            let required = if kw.required { " (required)" } else { "" };
            println!("    {}: {}{}", kw.name, kw.kind.as_str(), required);
        }
    }
}

fn init_config() -> ExitCode {
    match serde_yaml::to_string(&Config::default()) {
        Ok(yaml) => {
            println!("{}", yaml);
            println!("\nSave this to config.yaml and adjust as needed.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render config: {}", e);
            ExitCode::FAILURE
        }
    }
}

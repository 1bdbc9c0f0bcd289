mod server;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use flagwatch_lib::{FeatureType, Flag, Parameters, Registry, Value};

use crate::server::ServeArgs;

#[derive(Parser, Debug)]
#[command(name = "flagwatch")]
#[command(version)]
#[command(about = "Runtime feature flags with JSON hot-reload", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the registry over HTTP and keep it in sync with the features file
    Serve {
        /// Path to the features JSON file
        #[arg(short = 'f', long = "features")]
        features: Option<String>,

        /// Port to listen on
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,

        /// Address to bind
        #[arg(long = "hostname")]
        hostname: Option<String>,

        /// Serve the file as loaded at startup, without hot-reload or write-back
        #[arg(long = "no-watch")]
        no_watch: bool,

        /// Delay in milliseconds before a change is written back
        #[arg(long = "debounce-ms")]
        debounce_ms: Option<u64>,

        /// Path to config file
        #[arg(short = 'c', long = "config", default_value = "flagwatch.toml")]
        config: String,
    },
    /// Check that every flag in the features file is valid
    Validate {
        /// Path to the features JSON file
        #[arg(short = 'f', long = "features", default_value = "features.json")]
        features: String,
    },
    List {
        /// Path to the features JSON file
        #[arg(short = 'f', long = "features", default_value = "features.json")]
        features: String,

        /// Show flag descriptions
        #[arg(short = 'd', long = "description")]
        description: bool,
    },
    Eval {
        /// Path to the features JSON file
        #[arg(short = 'f', long = "features", default_value = "features.json")]
        features: String,

        /// Flag name to evaluate (e.g. new-checkout)
        flag_name: String,

        /// Parameters as key=value pairs (e.g. country=NZ age=30)
        params: Vec<String>,
    },
}

fn load(features_path: &str) -> Registry {
    let registry = Registry::new();
    if let Err(e) = registry.load_file(Path::new(features_path)) {
        eprintln!("Failed to load {}: {}", features_path, e);
        process::exit(1);
    }
    registry
}

/// `key=value` arguments become parameters; values are inferred as bool,
/// number or string. Arguments without `=` are skipped.
fn parse_params(args: &[String]) -> Parameters {
    args.iter()
        .filter_map(|arg| {
            let (key, value) = arg.split_once('=')?;
            Some((key.to_string(), Value::infer(value)))
        })
        .collect()
}

fn describe(flag: &Flag) -> String {
    match flag.kind() {
        FeatureType::Constant => format!("constant, {}", if flag.enabled() { "on" } else { "off" }),
        FeatureType::PercentageBased => format!("{}% rollout", flag.percentage()),
        FeatureType::Expression => format!("expression `{}`", flag.expression()),
        FeatureType::Unknown => "unknown".to_string(),
    }
}

fn run_list(features_path: &str, show_description: bool) {
    let registry = load(features_path);
    for (name, flag) in registry.snapshot() {
        if show_description && !flag.description().is_empty() {
            println!("{} ({})", name, flag.description());
        } else {
            println!("{}", name);
        }
    }
}

fn run_validate(features_path: &str) {
    let registry = load(features_path);

    println!("Flags:");
    for (name, flag) in registry.snapshot() {
        if flag.description().is_empty() {
            println!("  {} ({})", name, describe(&flag));
        } else {
            println!("  {} ({}) - {}", name, describe(&flag), flag.description());
        }
    }

    println!();
    println!("{} valid, {} flags", features_path, registry.len());
}

fn run_eval(features_path: &str, flag_name: &str, param_args: &[String]) {
    let registry = load(features_path);
    let params = parse_params(param_args);

    match registry.is_enabled(flag_name, &params) {
        Ok(enabled) => println!("{}", enabled),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Args::parse();
    match cli.cmd {
        Command::Serve {
            features,
            port,
            hostname,
            no_watch,
            debounce_ms,
            config,
        } => {
            server::run_serve(ServeArgs {
                config_path: PathBuf::from(config),
                features,
                port,
                hostname,
                no_watch,
                debounce_ms,
            })
            .await
        }
        Command::Validate { features } => run_validate(&features),
        Command::List {
            features,
            description,
        } => run_list(&features, description),
        Command::Eval {
            features,
            flag_name,
            params,
        } => run_eval(&features, &flag_name, &params),
    }
}

//! UDF sandbox CLI
//!
//! Registers a function module with a declared signature and calls it with
//! literal arguments.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{bail, Result, WrapErr};
use std::path::{Path, PathBuf};
use tracing::info;
use udf_core::{CqlType, CqlValue, FunctionName, FunctionSignature, NullPolicy};
use udf_wasm::{FunctionDefinition, Sandbox, SandboxConfig};

#[derive(Parser)]
#[command(name = "udf")]
#[command(about = "Run user-defined functions in a WASM sandbox", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a function and call it
    Call {
        #[command(flatten)]
        function: FunctionArgs,
        /// Arguments as literals, `null` for null
        args: Vec<String>,
    },
    /// Register a function and report its negotiated ABI
    Check {
        #[command(flatten)]
        function: FunctionArgs,
    },
}

#[derive(Args)]
struct FunctionArgs {
    /// Module source, text or binary
    #[arg(short, long)]
    module: PathBuf,
    /// Qualified name, `keyspace.function`
    #[arg(short, long)]
    name: String,
    /// Parameter type, repeated in call order
    #[arg(short, long = "param")]
    params: Vec<String>,
    /// Return type
    #[arg(short, long)]
    returns: String,
    /// Run the function on null input instead of returning null
    #[arg(long)]
    called_on_null: bool,
    /// Fuel budget, overrides the config file
    #[arg(long)]
    fuel: Option<u64>,
    /// Linear memory limit in bytes, overrides the config file
    #[arg(long)]
    memory_limit: Option<u64>,
    /// Check the exported function type at registration
    #[arg(long)]
    eager: bool,
    /// Sandbox config, JSON
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl FunctionArgs {
    fn signature(&self) -> Result<FunctionSignature> {
        let returns: CqlType = self.returns.parse()?;
        let params = self
            .params
            .iter()
            .map(|p| p.parse::<CqlType>())
            .collect::<Result<Vec<_>, _>>()?;
        let policy = if self.called_on_null {
            NullPolicy::CalledOnNullInput
        } else {
            NullPolicy::ReturnsNullOnNullInput
        };
        Ok(FunctionSignature::from_types(&params, returns).with_null_policy(policy))
    }

    fn sandbox_config(&self) -> Result<SandboxConfig> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(fuel) = self.fuel {
            config = config.with_max_fuel(fuel);
        }
        if let Some(limit) = self.memory_limit {
            config = config.with_memory_limit(limit);
        }
        if self.eager {
            config = config.with_eager_signature_check(true);
        }
        Ok(config)
    }

    fn register(&self) -> Result<(Sandbox, FunctionDefinition)> {
        let name: FunctionName = self.name.parse()?;
        let signature = self.signature()?;
        let source = std::fs::read(&self.module)
            .wrap_err_with(|| format!("reading module {}", self.module.display()))?;
        let sandbox = Sandbox::new(self.sandbox_config()?)?;
        let definition = sandbox.register(name, signature, &source)?;
        Ok((sandbox, definition))
    }
}

/// Load a sandbox config from a JSON file, defaults when no path is given
fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    let Some(path) = path else {
        return Ok(SandboxConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading config {}", path.display()))?;
    let config = serde_json::from_str(&text)
        .wrap_err_with(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

/// Parse literal arguments against the declared signature
fn parse_args(
    signature: &FunctionSignature,
    literals: &[String],
) -> Result<Vec<Option<CqlValue>>> {
    if literals.len() != signature.arity() {
        bail!(
            "invalid number of arguments: expected {}, got {}",
            signature.arity(),
            literals.len()
        );
    }
    signature
        .param_types()
        .zip(literals)
        .map(|(ty, literal)| {
            if literal.eq_ignore_ascii_case("null") {
                Ok(None)
            } else {
                Ok(Some(CqlValue::parse_literal(ty, literal)?))
            }
        })
        .collect()
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("udf=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Call { function, args } => {
            let (sandbox, definition) = function.register()?;
            let args = parse_args(definition.signature(), &args)?;
            let invocation = sandbox.call(&definition, &args)?;
            info!(
                function = %definition.name(),
                fuel = invocation.fuel_consumed,
                executed = invocation.executed,
                "call finished"
            );
            match invocation.value {
                Some(value) => println!("{}", value),
                None => println!("null"),
            }
            Ok(())
        }
        Commands::Check { function } => {
            let (_, definition) = function.register()?;
            println!(
                "{} {} abi {} source {}",
                definition.name(),
                definition.signature(),
                definition.abi(),
                definition.source_hash().short()
            );
            Ok(())
        }
    }
}

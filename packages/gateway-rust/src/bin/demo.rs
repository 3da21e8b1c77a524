//! `capgate-demo`: runs a scripted workload through a gateway and prints its
//! status as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use capgate_core::{args, Arguments, CapabilityModule, Interface, OperationKey, Value};
use capgate_gateway::telemetry::{init_tracing, LogFormat};
use capgate_gateway::{
    build_gateway_pipeline, spawn_maintenance, Gateway, GatewayConfig, Invocation,
    MaintenanceTask, ModuleCategory, ModuleDescriptor, OperationRegistry, OperationSpec,
    UnloadPolicy,
};
use clap::Parser;
use tower::ServiceExt;

#[derive(Parser)]
#[command(
    name = "capgate-demo",
    about = "Drive a capgate gateway with a synthetic workload"
)]
struct Cli {
    /// JSON configuration file. Unspecified fields use defaults.
    #[arg(long, env = "CAPGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of workload rounds to run.
    #[arg(long, default_value_t = 50)]
    rounds: u32,

    /// Log format.
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, env = "CAPGATE_LOG", default_value = "info")]
    log_level: String,

    /// Background maintenance interval in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    tick_ms: u64,
}

/// Stand-in capability: answers every operation from its arguments.
struct DemoModule {
    name: &'static str,
}

impl CapabilityModule for DemoModule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn call(&self, operation: &str, args: &Arguments) -> anyhow::Result<Value> {
        match (self.name, operation) {
            ("validation", "check") => {
                let input = args.get("input").and_then(Value::as_str).unwrap_or_default();
                if input.is_empty() {
                    anyhow::bail!("input must not be empty");
                }
                Ok(Value::Bool(input.chars().all(char::is_alphanumeric)))
            }
            ("http", "get") => {
                let url = args.get("url").and_then(Value::as_str).unwrap_or("/");
                Ok(Value::from(format!("200 OK {url}")))
            }
            _ => {
                let mut out = args.clone();
                out.insert("handled_by".into(), Value::from(self.name));
                out.insert("operation".into(), Value::from(operation));
                Ok(Value::Map(out))
            }
        }
    }

    fn on_unload(&self) -> anyhow::Result<()> {
        tracing::debug!(module = self.name, "demo module released");
        Ok(())
    }
}

fn module(name: &'static str, category: ModuleCategory) -> ModuleDescriptor {
    ModuleDescriptor::new(name, category, move || Ok(DemoModule { name }))
}

fn registry() -> anyhow::Result<OperationRegistry> {
    let registry = OperationRegistry::builder()
        .module(module("cache", ModuleCategory::Core))
        .module(module("logging", ModuleCategory::Core))
        .module(module("validation", ModuleCategory::Core))
        .module(module("metrics", ModuleCategory::Core))
        .module(
            module("notify", ModuleCategory::Feature)
                .with_policy(UnloadPolicy::IdleTimeout { idle_ms: 30_000 }),
        )
        .module(
            module("storage", ModuleCategory::Feature)
                .with_policy(UnloadPolicy::MemoryPressure)
                .with_footprint(4 * 1024 * 1024),
        )
        .module(module("http", ModuleCategory::Conditional))
        .module(module("smart-home", ModuleCategory::Conditional))
        .operation(OperationSpec::new(OperationKey::new(Interface::Cache, "get"), "cache"))
        .operation(
            OperationSpec::new(OperationKey::new(Interface::Cache, "set"), "cache").uncacheable(),
        )
        .operation(
            OperationSpec::new(OperationKey::new(Interface::Logging, "write"), "logging")
                .uncacheable(),
        )
        .operation(OperationSpec::new(
            OperationKey::new(Interface::Validation, "check"),
            "validation",
        ))
        .operation(
            OperationSpec::new(OperationKey::new(Interface::Metrics, "record"), "metrics")
                .uncacheable(),
        )
        .operation(OperationSpec::new(OperationKey::new(Interface::Notify, "send"), "notify"))
        .operation(
            OperationSpec::new(OperationKey::new(Interface::Storage, "put"), "storage")
                .uncacheable()
                .with_cost(5),
        )
        .operation(
            OperationSpec::new(OperationKey::new(Interface::Http, "get"), "http")
                .with_ttl(Duration::from_secs(15))
                .with_cost(3),
        )
        .operation(OperationSpec::new(
            OperationKey::new(Interface::SmartHome, "set-state"),
            "smart-home",
        ))
        .build()?;
    Ok(registry)
}

/// The invocations issued in round `round`.
fn workload(round: u32) -> Vec<Invocation> {
    let n = i64::from(round);
    let mut batch = vec![
        Invocation::new(
            OperationKey::new(Interface::Cache, "get"),
            args([("key", Value::from("session"))]),
        ),
        Invocation::new(
            OperationKey::new(Interface::Logging, "write"),
            args([("line", Value::from(format!("round {round}")))]),
        ),
        Invocation::new(
            OperationKey::new(Interface::Validation, "check"),
            args([("input", Value::from(format!("user{}", round % 4)))]),
        ),
    ];
    if round % 5 == 0 {
        batch.push(Invocation::new(
            OperationKey::new(Interface::Http, "get"),
            args([("url", Value::from("/status"))]),
        ));
    }
    if round % 7 == 0 {
        batch.push(Invocation::new(
            OperationKey::new(Interface::Notify, "send"),
            args([("to", Value::from("ops")), ("round", Value::Int(n))]),
        ));
    }
    if round % 10 == 0 {
        batch.push(Invocation::new(
            OperationKey::new(Interface::Storage, "put"),
            args([("blob", Value::Bytes(vec![0; 256]))]),
        ));
        batch.push(Invocation::new(
            OperationKey::new(Interface::SmartHome, "set-state"),
            args([("device", Value::from("lamp")), ("on", Value::Bool(round % 20 == 0))]),
        ));
    }
    batch
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, &cli.log_level)?;

    let config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            GatewayConfig::from_json_str(&raw)?
        }
        None => GatewayConfig::default(),
    };

    let gateway = Arc::new(Gateway::new(registry()?, config)?);
    let mut maintenance = spawn_maintenance(gateway.clone(), Duration::from_millis(cli.tick_ms));
    let pipeline = build_gateway_pipeline(gateway.clone());

    let mut call_id = 0_u64;
    let mut failures = 0_u32;
    for round in 0..cli.rounds {
        for invocation in workload(round) {
            call_id += 1;
            let key = invocation.key.clone();
            if let Err(err) = pipeline
                .clone()
                .oneshot(invocation.with_call_id(call_id))
                .await
            {
                failures += 1;
                tracing::warn!(key = %key, error = %err, "demo invocation failed");
                if err.is_budget_exceeded() {
                    break;
                }
            }
        }
    }

    maintenance.submit(MaintenanceTask::Tick).await?;
    maintenance.stop().await;

    tracing::info!(calls = call_id, failures, "workload finished");
    println!("{}", serde_json::to_string_pretty(&gateway.status())?);
    Ok(())
}

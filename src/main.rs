//! `ordo` command line: run the order-processing sample and inspect stored instances.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};

use ordo::providers::fs::FsHistoryStore;
use ordo::providers::in_memory::InMemoryHistoryStore;
use ordo::providers::{HistoryStore, InstanceStatus, ProviderError};
use ordo::runtime::{LogFormat, ObservabilityConfig, Runtime, RuntimeOptions, init_logging};
use ordo::samples::order_processing::{self, SampleOptions};
use ordo::{ClientError, InstanceRecord};

#[derive(Parser)]
#[command(name = "ordo", version, about = "Durable orchestration engine")]
struct Cli {
    /// Log output format: compact, pretty or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Log level for engine targets (RUST_LOG overrides)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the order-processing workflow for one order
    Run {
        #[arg(long)]
        order_id: String,

        /// Persist history under this directory (in-memory when omitted)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Make the payment step fail
        #[arg(long)]
        fail_payment: bool,

        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,

        /// Use background dispatchers instead of ticking the runtime
        #[arg(long)]
        background: bool,
    },
    /// Print a stored instance and its history
    Status {
        #[arg(long)]
        data_dir: PathBuf,

        #[arg(long)]
        instance: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ObservabilityConfig {
        log_format: cli.log_format,
        log_level: cli.log_level.clone(),
    };
    if let Err(e) = init_logging(&config) {
        eprintln!("ordo: {e}");
    }

    match cli.command {
        Commands::Run {
            order_id,
            data_dir,
            fail_payment,
            timeout_secs,
            background,
        } => {
            let store: Arc<dyn HistoryStore> = match data_dir {
                Some(dir) => Arc::new(FsHistoryStore::new(dir, false)),
                None => Arc::new(InMemoryHistoryStore::new()),
            };
            let record = run_order(
                store,
                &order_id,
                SampleOptions { fail_payment },
                Duration::from_secs(timeout_secs),
                background,
            )
            .await?;
            print_record(&record);
            if record.status != InstanceStatus::Completed {
                bail!("order {order_id} finished as {}", record.status);
            }
            Ok(())
        }
        Commands::Status { data_dir, instance } => {
            let store = FsHistoryStore::new(&data_dir, false);
            let record = store
                .get_instance(&instance)
                .await?
                .with_context(|| format!("instance '{instance}' not found under {}", data_dir.display()))?;
            print_record(&record);
            for event in store.read(&instance).await? {
                println!("  {}", serde_json::to_string(&event)?);
            }
            Ok(())
        }
    }
}

async fn run_order(
    store: Arc<dyn HistoryStore>,
    order_id: &str,
    sample: SampleOptions,
    timeout: Duration,
    background: bool,
) -> anyhow::Result<InstanceRecord> {
    let activities = order_processing::activities(sample);
    let orchestrations = order_processing::orchestrations();
    let options = RuntimeOptions::default();

    let rt = if background {
        Runtime::start(store, activities, orchestrations, options).await?
    } else {
        Runtime::with_options(store, activities, orchestrations, options).await?
    };
    let client = rt.client();

    match client
        .schedule_with_id(order_id, order_processing::ORDER_PROCESSING, order_id)
        .await
    {
        Ok(()) => {}
        // Already stored: recovery has queued whatever work remains.
        Err(ClientError::Provider(ProviderError::InstanceExists(_))) => {
            tracing::info!(instance_id = %order_id, "resuming existing instance");
        }
        Err(e) => return Err(e.into()),
    }

    let record = if background {
        let res = client.wait_for_completion(order_id, timeout).await;
        rt.shutdown(Duration::from_secs(1)).await;
        res?
    } else {
        tokio::time::timeout(timeout, rt.run_until_idle())
            .await
            .context("timed out driving the runtime")?;
        client.get_status(order_id).await?
    };
    Ok(record)
}

fn print_record(record: &InstanceRecord) {
    println!("instance:      {}", record.instance_id);
    println!("orchestration: {}", record.orchestration);
    println!("status:        {}", record.status);
    if let Some(output) = &record.output {
        println!("output:        {output}");
    }
}

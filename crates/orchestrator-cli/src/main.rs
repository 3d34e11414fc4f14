//! Runs vault computations end to end against an in-process simulated cluster.
use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use clap::Parser;
use futures::future::try_join_all;
use mpc_orchestrator::{
    OrchestratorConfig,
    cluster::{
        Fault, LocalCluster, StreamCipher,
        vault::{self, Deposit, InitVault, VAULT_LAYOUT},
    },
    definition::{MemoryCircuitSource, MemoryRegistry, ensure_registered},
    dispatch::CallbackDispatcher,
    encoding::{self, ArgumentBuilder},
    ledger::{AbortReason, MemoryLedger, Namespace, OutputTarget},
    mutator::StateMutator,
    retry::RetryOrchestrator,
    scheduler::{QueueRequest, Scheduler},
    store::{MemoryStore, StateStore, StoreKey},
    verifier::{CallbackVerifier, ClusterId, ClusterSigner},
};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

const INIT_LOCATION: &str = "mem://circuits/init_vault";
const DEPOSIT_LOCATION: &str = "mem://circuits/deposit";

type Orchestrator = RetryOrchestrator<MemoryRegistry, MemoryLedger, MemoryStore>;

/// Initializes encrypted vaults and deposits into them through a simulated MPC cluster.
///
/// Logging can be controlled with an EnvFilter via the `MPC_ORCHESTRATOR_LOG` environment
/// variable.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// JSON configuration file. Durations are given in milliseconds.
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Overrides the maximum number of attempts per computation.
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Overrides the finalization timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Number of vaults, initialized concurrently.
    #[arg(long, default_value_t = 1)]
    vaults: usize,
    /// Amounts deposited into every vault after initialization.
    #[arg(long, value_delimiter = ',')]
    deposits: Vec<u128>,
    /// Number of computations the cluster aborts before it starts succeeding.
    #[arg(long, default_value_t = 0)]
    abort_first: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing().context("tracing initialization")?;

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let namespace = Namespace::new("vaults");
    let store = Arc::new(MemoryStore::new());
    let orchestrator = deploy(&cli, &config, namespace.clone(), store.clone())?;

    let vaults = (0..cli.vaults)
        .map(|i| -> anyhow::Result<StoreKey> {
            let key = StoreKey::derive(&format!("vaults/{i}"));
            store.create_zeroed(key.clone(), namespace.clone(), &VAULT_LAYOUT)?;
            Ok(key)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (orchestrator, retry) = (&orchestrator, &config.retry);
    try_join_all(vaults.iter().map(|key| async move {
        orchestrator
            .run(
                vault::INIT_VAULT,
                |id| {
                    Ok(QueueRequest {
                        id,
                        definition: vault::INIT_VAULT.into(),
                        args: ArgumentBuilder::new().build(),
                        routing: vec![OutputTarget::writable(key.clone(), VAULT_LAYOUT)],
                    })
                },
                retry,
            )
            .await
            .with_context(|| format!("initializing vault {key}"))
    }))
    .await?;

    for key in &vaults {
        for &amount in &cli.deposits {
            let accepted = deposit(orchestrator, &*store, key, amount, &config).await?;
            info!(vault = %key, amount, accepted, "deposit finalized");
        }
        let bytes = store.read(key).context("vault vanished")?;
        let state = VAULT_LAYOUT.read_state(&bytes)?;
        println!("{key}: nonce {:#034x}", state.nonce);
    }
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<OrchestratorConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("opening config {}", path.display()))?;
            serde_json::from_reader(file).context("parsing config")?
        }
        None => OrchestratorConfig::default(),
    };
    if let Some(max_attempts) = cli.max_attempts {
        config.retry.max_attempts = max_attempts;
    }
    if let Some(timeout) = cli.timeout_ms {
        config.retry.finalization_timeout = Duration::from_millis(timeout);
    }
    config.validate()?;
    Ok(config)
}

fn deploy(
    cli: &Cli,
    config: &OrchestratorConfig,
    namespace: Namespace,
    store: Arc<MemoryStore>,
) -> anyhow::Result<Orchestrator> {
    let registry = Arc::new(MemoryRegistry::new());
    let ledger = Arc::new(MemoryLedger::new());
    let source = Arc::new(MemoryCircuitSource::new());

    source.publish(INIT_LOCATION, vault::INIT_VAULT_CIRCUIT.to_vec());
    source.publish(DEPOSIT_LOCATION, vault::DEPOSIT_CIRCUIT.to_vec());
    ensure_registered(&*registry, vault::init_vault_definition(INIT_LOCATION))?;
    ensure_registered(&*registry, vault::deposit_definition(DEPOSIT_LOCATION))?;

    let signer = ClusterSigner::generate(ClusterId(1));
    let dispatcher = Arc::new(CallbackDispatcher::new(
        CallbackVerifier::new(signer.key()),
        StateMutator::new(store.clone()),
    ));
    let cluster = LocalCluster::new(
        signer,
        registry.clone(),
        ledger.clone(),
        store.clone(),
        source,
    )
    .with_poll_interval(config.pickup_poll_interval)
    .install(vault::INIT_VAULT_CIRCUIT, InitVault)
    .install(vault::DEPOSIT_CIRCUIT, Deposit);
    for _ in 0..cli.abort_first {
        cluster.inject(Fault::Abort(AbortReason::CheatDetected));
    }
    Arc::new(cluster).spawn();

    let scheduler = Scheduler::new(namespace, registry.clone(), ledger.clone(), store);
    Ok(RetryOrchestrator::new(scheduler, registry, ledger, dispatcher))
}

async fn deposit(
    orchestrator: &Orchestrator,
    store: &MemoryStore,
    key: &StoreKey,
    amount: u128,
    config: &OrchestratorConfig,
) -> anyhow::Result<bool> {
    // the client key is fixed, the cluster derives its cipher from the public key alone
    let public_key = [0xa1; 32];
    let params = vault::deposit_definition(DEPOSIT_LOCATION).signature.params;
    let bytes = store
        .read(key)
        .with_context(|| format!("vault {key} does not exist"))?;
    // aborted attempts leave the vault untouched, so its nonce holds across retries
    let vault_nonce = VAULT_LAYOUT.read_state(&bytes)?.nonce;
    let output = orchestrator
        .run(
            vault::DEPOSIT,
            |id| {
                let nonce = u128::from(id.0) + 1;
                let encrypted = StreamCipher::for_public_key(&public_key).encrypt(nonce, &[amount])[0];
                let values = vault::deposit_values(public_key, nonce, encrypted, key.clone(), vault_nonce);
                Ok(QueueRequest {
                    id,
                    definition: vault::DEPOSIT.into(),
                    args: encoding::encode(&params, &values)?,
                    routing: vec![OutputTarget::writable(key.clone(), VAULT_LAYOUT)],
                })
            },
            &config.retry,
        )
        .await
        .with_context(|| format!("depositing {amount} into {key}"))?;
    match output.revealed().as_slice() {
        [[accepted]] => Ok(*accepted == 1),
        other => bail!("unexpected revealed output {other:?}"),
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_env_var("MPC_ORCHESTRATOR_LOG")
        .with_default_directive("mpc_orchestrator=info".parse()?)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .init();

    Ok(())
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use keel_core::clients::{AzClient, HcloudClient, OpClient, ResourceApi, VaultApi};
use keel_core::config::{InstanceConfig, KeelConfig};
use keel_core::credential::{BackendResolver, Credentials, SshKeygen};
use keel_core::operator::{FixedAnswer, Operator};
use keel_core::orchestrator::{identity_plan, AppPairState, RunContext, RunFailure};
use keel_core::poll::PollOutcome;
use keel_core::reconciler::{ReconciliationOutcome, ResourceReconciler};
use keel_core::resource::{DesiredResourceSpec, ResourceKind};
use keel_core::ssh_config::{HostEntry, SshConfigFile};
use keel_core::ProvisionError;
use tabled::{Table, Tabled};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod prompt;

use prompt::{confirm_or_abort, TerminalOperator};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Converge servers, firewalls, SSH keys and identity registrations", long_about = None)]
struct Cli {
    /// Desired-state file
    #[arg(short, long, global = true, default_value = "keel.toml")]
    config: PathBuf,

    /// Approve every confirmation
    #[arg(long, global = true, conflicts_with = "no")]
    yes: bool,

    /// Decline every confirmation
    #[arg(long, global = true)]
    no: bool,

    /// Compute provider CLI
    #[arg(long, global = true, env = "KEEL_HCLOUD", default_value = "hcloud")]
    hcloud: String,

    /// Identity provider CLI
    #[arg(long, global = true, env = "KEEL_AZ", default_value = "az")]
    az: String,

    /// Secret vault CLI
    #[arg(long, global = true, env = "KEEL_OP", default_value = "op")]
    op: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// SSH key material for the project
    Credential {
        #[command(subcommand)]
        command: CredentialCommand,
    },

    /// Converge a single resource
    Reconcile {
        #[command(subcommand)]
        resource: ReconcileCommand,
    },

    /// Identity provider registrations
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },

    /// Credentials, SSH key, firewall, instance and SSH client config in one go
    Up,
}

#[derive(Subcommand)]
enum CredentialCommand {
    /// Show the active backend
    Backend,
    /// Create or migrate the project key
    Init,
    /// Print the public key
    PublicKey,
    /// Print where the private key lives
    PrivateKeyRef,
}

#[derive(Subcommand)]
enum ReconcileCommand {
    Firewall,
    SshKey,
    Instance,
}

#[derive(Subcommand)]
enum IdentityCommand {
    /// Create both application registrations and persist the client secret
    Provision,
}

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "OUTCOME")]
    outcome: String,
    #[tabled(rename = "ID")]
    id: String,
}

impl OutcomeRow {
    fn new(spec: &DesiredResourceSpec, outcome: &ReconciliationOutcome) -> Self {
        Self {
            kind: spec.kind().to_string(),
            name: spec.name.clone(),
            outcome: outcome.label().to_string(),
            id: outcome.id().unwrap_or("-").to_string(),
        }
    }
}

/// Everything a command needs, built once from the command line and config file.
struct Session {
    config: KeelConfig,
    operator: Arc<dyn Operator>,
    resources: Arc<dyn ResourceApi>,
    vault: Arc<dyn VaultApi>,
    resolver: BackendResolver,
    az: String,
}

impl Session {
    async fn open(cli: &Cli) -> Result<Self> {
        let config = KeelConfig::load(&cli.config)
            .await
            .with_context(|| format!("Failed to load {}", cli.config.display()))?;

        let operator: Arc<dyn Operator> = if cli.yes {
            Arc::new(FixedAnswer::approve_all())
        } else if cli.no {
            Arc::new(FixedAnswer::decline_all())
        } else {
            Arc::new(TerminalOperator::new())
        };
        let vault: Arc<dyn VaultApi> = Arc::new(OpClient::new(&cli.op));

        Ok(Self {
            config,
            operator,
            resources: Arc::new(HcloudClient::new(&cli.hcloud)),
            resolver: BackendResolver::new(Arc::clone(&vault)),
            vault,
            az: cli.az.clone(),
        })
    }

    async fn credentials(&self) -> Credentials {
        let kind = self.resolver.resolve().await;
        Credentials::for_kind(
            kind,
            &self.config.credentials,
            Arc::clone(&self.vault),
            Arc::new(SshKeygen::new("ssh-keygen")),
            Arc::clone(&self.operator),
        )
    }

    fn reconciler(&self) -> ResourceReconciler {
        ResourceReconciler::new(Arc::clone(&self.resources), Arc::clone(&self.operator))
    }

    fn project(&self) -> &str {
        &self.config.project
    }

    async fn ssh_key_spec(&self, credentials: &Credentials) -> Result<DesiredResourceSpec> {
        let public = credentials
            .backend
            .public_key(self.project())
            .await
            .context("No SSH key for this project, run `keel credential init` first")?;
        Ok(DesiredResourceSpec::ssh_key(
            self.config.ssh_key_name(),
            public.as_str(),
        ))
    }

    fn section<T>(&self, value: Option<T>, section: &str) -> Result<T> {
        value.ok_or_else(|| anyhow!("config for {} has no [{}] section", self.project(), section))
    }
}

async fn credential_command(session: &Session, command: CredentialCommand) -> Result<()> {
    let project = session.project();
    match command {
        CredentialCommand::Backend => {
            println!("{}", session.resolver.resolve().await);
        }
        CredentialCommand::Init => {
            let credentials = session.credentials().await;
            credentials
                .backend
                .init(project)
                .await
                .context("Failed to initialize SSH key")?;
            println!(
                "SSH key for {} ready ({} backend)",
                project,
                credentials.backend.kind()
            );
        }
        CredentialCommand::PublicKey => {
            let key = session.credentials().await.backend.public_key(project).await?;
            println!("{}", key.as_str());
        }
        CredentialCommand::PrivateKeyRef => {
            let reference = session
                .credentials()
                .await
                .backend
                .private_key_reference(project)
                .await?;
            println!("Backend:  {}", reference.backend());
            println!("Location: {}", reference.location());
            for (keyword, value) in reference.ssh_directives() {
                println!("  {} {}", keyword, value);
            }
        }
    }
    Ok(())
}

/// Reconcile one spec, record its row, and stop on a hard failure.
async fn reconcile_into(
    reconciler: &ResourceReconciler,
    spec: &DesiredResourceSpec,
    rows: &mut Vec<OutcomeRow>,
) -> Result<String> {
    let outcome = reconciler.reconcile(spec).await;
    rows.push(OutcomeRow::new(spec, &outcome));
    outcome
        .into_result()
        .with_context(|| format!("Failed to reconcile {} '{}'", spec.kind(), spec.name))
}

fn print_rows(rows: Vec<OutcomeRow>) {
    if !rows.is_empty() {
        println!("{}", Table::new(rows));
    }
}

async fn reconcile_command(session: &Session, resource: ReconcileCommand) -> Result<()> {
    let spec = match resource {
        ReconcileCommand::Firewall => session.section(session.config.firewall_spec(), "firewall")?,
        ReconcileCommand::Instance => session.section(session.config.instance_spec(), "instance")?,
        ReconcileCommand::SshKey => {
            let credentials = session.credentials().await;
            session.ssh_key_spec(&credentials).await?
        }
    };

    let mut rows = Vec::new();
    let result = reconcile_into(&session.reconciler(), &spec, &mut rows).await;
    print_rows(rows);
    result.map(|_| ())
}

async fn identity_command(session: &Session, command: IdentityCommand) -> Result<()> {
    match command {
        IdentityCommand::Provision => {
            let identity_config = session.section(session.config.identity.as_ref(), "identity")?;
            let credentials = session.credentials().await;
            let orchestrator = identity_plan(
                identity_config,
                Arc::new(AzClient::new(&session.az)),
                credentials.secrets,
                session.project(),
            )?;
            info!("Identity run: {}", orchestrator.step_names().join(" -> "));

            let mut ctx = RunContext::new(AppPairState::default());
            let summary = orchestrator.run(&mut ctx).await?;

            for credential in ctx.state.credentials() {
                println!(
                    "app {} (object {}) stored in {} backend",
                    credential.principal_id, credential.object_id, credential.backend
                );
            }
            for warning in &summary.warnings {
                warn!("{}", warning);
            }
            if summary.is_partial() {
                println!(
                    "Identity provisioned with {} warning(s), see above",
                    summary.warnings.len()
                );
            } else {
                println!("Identity provisioned ({} steps)", summary.steps_completed);
            }
        }
    }
    Ok(())
}

/// Wait for the instance, asking whether to go on when it is not ready in time.
async fn await_instance(
    session: &Session,
    reconciler: &ResourceReconciler,
    instance: &InstanceConfig,
) -> Result<()> {
    let timeout = Duration::from_secs(instance.ready_timeout_secs);
    match reconciler
        .instances()
        .wait_ready(
            &instance.name,
            Duration::from_secs(instance.poll_interval_secs),
            timeout,
        )
        .await
    {
        PollOutcome::Ready { attempts } => {
            info!("Instance {} ready after {} check(s)", instance.name, attempts);
        }
        PollOutcome::TimedOut { attempts } => {
            warn!(
                "Instance {} not ready after {}s ({} checks)",
                instance.name,
                timeout.as_secs(),
                attempts
            );
            confirm_or_abort(
                session.operator.as_ref(),
                &format!(
                    "Instance '{}' is not ready yet. Continue anyway?",
                    instance.name
                ),
                "instance not ready",
            )
            .await?;
        }
    }
    Ok(())
}

async fn up(session: &Session) -> Result<()> {
    let project = session.project();
    let instance = session.section(session.config.instance.as_ref(), "instance")?;
    let credentials = session.credentials().await;
    credentials
        .backend
        .init(project)
        .await
        .context("Failed to initialize SSH key")?;

    let reconciler = session.reconciler();
    let mut specs = vec![session.ssh_key_spec(&credentials).await?];
    specs.extend(session.config.firewall_spec());
    specs.extend(session.config.instance_spec());

    let mut rows = Vec::new();
    for spec in &specs {
        if let Err(e) = reconcile_into(&reconciler, spec, &mut rows).await {
            print_rows(rows);
            return Err(e);
        }
    }
    print_rows(rows);

    await_instance(session, &reconciler, instance).await?;

    if !session.config.ssh_config.enabled {
        return Ok(());
    }
    let observed = reconciler.instances().observe(&instance.name).await?;
    let Some(address) = observed.and_then(|o| o.public_ipv4) else {
        warn!(
            "{} '{}' has no public address yet, SSH config not updated",
            ResourceKind::Instance,
            instance.name
        );
        return Ok(());
    };

    let key = credentials.backend.private_key_reference(project).await?;
    let entry = HostEntry::new(&instance.name, &address, &instance.user).with_key(&key);
    let ssh_config = SshConfigFile::new(&session.config.ssh_config.path);
    let changed = ssh_config
        .apply(&entry)
        .await
        .with_context(|| format!("Failed to update {}", ssh_config.path().display()))?;
    if changed {
        println!("Updated {} (ssh {})", ssh_config.path().display(), instance.name);
    } else {
        println!("{} already up to date", ssh_config.path().display());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let session = Session::open(&cli).await?;
    match cli.command {
        Commands::Credential { command } => credential_command(&session, command).await,
        Commands::Reconcile { resource } => reconcile_command(&session, resource).await,
        Commands::Identity { command } => identity_command(&session, command).await,
        Commands::Up => up(&session).await,
    }
}

fn is_user_abort(err: &anyhow::Error) -> bool {
    if let Some(failure) = err.downcast_ref::<RunFailure>() {
        return failure.is_user_abort();
    }
    err.downcast_ref::<ProvisionError>()
        .is_some_and(ProvisionError::is_user_abort)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel=info,keel_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_user_abort(&e) => {
            eprintln!("Aborted: {:#}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

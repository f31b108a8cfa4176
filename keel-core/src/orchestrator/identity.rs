//! Identity provider workflow: a paired server (API) and client (web)
//! application registration, each backed by a service principal, with the
//! client secret persisted to the active secret store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Orchestrator, ProvisionStep, RollbackEntry, RunContext, StepOutcome, Verifier};
use crate::clients::{AppPatch, IdentityApi, ItemField};
use crate::config::{AppConfig, IdentityConfig};
use crate::credential::{BackendKind, Credential, Secret, SecretStore};
use crate::error::{ProvisionError, Result};

pub const TENANT_ID: &str = "TENANT_ID";
pub const SERVER_APP_ID: &str = "SERVER_APP_ID";
pub const CLIENT_ID: &str = "CLIENT_ID";
pub const CLIENT_SECRET: &str = "CLIENT_SECRET";

/// Placeholder in configured URIs replaced by the registration's app id.
const APP_ID_PLACEHOLDER: &str = "{app_id}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Exposes the API.
    Server,
    /// Signs users in and calls the API.
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }

    /// Secret store key under which this role's app id is persisted.
    pub fn id_key(&self) -> &'static str {
        match self {
            Role::Server => SERVER_APP_ID,
            Role::Client => CLIENT_ID,
        }
    }
}

/// Ids recorded for one registration as the run progresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    pub app_id: Option<String>,
    pub object_id: Option<String>,
    pub sp_id: Option<String>,
}

/// Step state of an identity run.
#[derive(Debug, Default)]
pub struct AppPairState {
    pub tenant_id: Option<String>,
    pub server: Registration,
    pub client: Registration,
    pub secret: Option<Secret>,
    /// Where the secret ended up, once persisted.
    pub persisted_to: Option<BackendKind>,
}

impl AppPairState {
    pub fn registration(&self, role: Role) -> &Registration {
        match role {
            Role::Server => &self.server,
            Role::Client => &self.client,
        }
    }

    fn registration_mut(&mut self, role: Role) -> &mut Registration {
        match role {
            Role::Server => &mut self.server,
            Role::Client => &mut self.client,
        }
    }

    fn app_id(&self, role: Role) -> Result<String> {
        self.registration(role).app_id.clone().ok_or_else(|| {
            ProvisionError::Internal(format!("no {} application created yet", role.as_str()))
        })
    }

    /// Credentials produced by a successful run. Only the client carries a secret.
    pub fn credentials(&self) -> Vec<Credential> {
        let Some(backend) = self.persisted_to else {
            return Vec::new();
        };
        [Role::Server, Role::Client]
            .into_iter()
            .filter_map(|role| {
                let reg = self.registration(role);
                Some(Credential {
                    principal_id: reg.app_id.clone()?,
                    object_id: reg.object_id.clone()?,
                    secret: match role {
                        Role::Client => self.secret.clone(),
                        Role::Server => None,
                    },
                    backend,
                })
            })
            .collect()
    }
}

fn substitute(uris: &[String], app_id: &str) -> Vec<String> {
    uris.iter()
        .map(|uri| uri.replace(APP_ID_PLACEHOLDER, app_id))
        .collect()
}

struct Authenticate {
    identity: Arc<dyn IdentityApi>,
}

#[async_trait]
impl ProvisionStep<AppPairState> for Authenticate {
    fn name(&self) -> String {
        "authenticate".to_string()
    }

    async fn execute(&self, ctx: &mut RunContext<AppPairState>) -> Result<StepOutcome> {
        let account = self.identity.account().await?;
        info!("Signed in as {} (tenant {})", account.user, account.tenant_id);
        ctx.state.tenant_id = Some(account.tenant_id);
        Ok(StepOutcome::Done)
    }
}

struct CreateApplication {
    identity: Arc<dyn IdentityApi>,
    role: Role,
    display_name: String,
    audience: String,
}

#[async_trait]
impl ProvisionStep<AppPairState> for CreateApplication {
    fn name(&self) -> String {
        format!("create application ({})", self.role.as_str())
    }

    async fn execute(&self, ctx: &mut RunContext<AppPairState>) -> Result<StepOutcome> {
        let ids = self
            .identity
            .create_app(&self.display_name, &self.audience)
            .await?;
        info!("Created application '{}' ({})", self.display_name, ids.app_id);

        let reg = ctx.state.registration_mut(self.role);
        reg.app_id = Some(ids.app_id.clone());
        reg.object_id = Some(ids.object_id);

        let identity = Arc::clone(&self.identity);
        let app_id = ids.app_id;
        Ok(StepOutcome::Created(RollbackEntry::new(
            format!("delete application '{}' ({})", self.display_name, app_id),
            move || async move { identity.delete_app(&app_id).await },
        )))
    }
}

struct ConfigureApplication {
    identity: Arc<dyn IdentityApi>,
    role: Role,
    redirect_uris: Vec<String>,
    identifier_uris: Vec<String>,
}

#[async_trait]
impl ProvisionStep<AppPairState> for ConfigureApplication {
    fn name(&self) -> String {
        format!("configure application ({})", self.role.as_str())
    }

    async fn execute(&self, ctx: &mut RunContext<AppPairState>) -> Result<StepOutcome> {
        let app_id = ctx.state.app_id(self.role)?;
        let patch = AppPatch {
            redirect_uris: substitute(&self.redirect_uris, &app_id),
            identifier_uris: substitute(&self.identifier_uris, &app_id),
        };
        if !patch.is_empty() {
            self.identity.update_app(&app_id, &patch).await?;
        }
        Ok(StepOutcome::Done)
    }
}

struct GrantPermissions {
    identity: Arc<dyn IdentityApi>,
    role: Role,
    app: AppConfig,
}

#[async_trait]
impl ProvisionStep<AppPairState> for GrantPermissions {
    fn name(&self) -> String {
        format!("grant permissions ({})", self.role.as_str())
    }

    async fn execute(&self, ctx: &mut RunContext<AppPairState>) -> Result<StepOutcome> {
        let app_id = ctx.state.app_id(self.role)?;
        for grant in &self.app.permissions {
            self.identity.add_permission(&app_id, grant).await?;
        }
        Ok(StepOutcome::Done)
    }
}

struct CreateServicePrincipal {
    identity: Arc<dyn IdentityApi>,
    role: Role,
}

#[async_trait]
impl ProvisionStep<AppPairState> for CreateServicePrincipal {
    fn name(&self) -> String {
        format!("create service principal ({})", self.role.as_str())
    }

    async fn execute(&self, ctx: &mut RunContext<AppPairState>) -> Result<StepOutcome> {
        let app_id = ctx.state.app_id(self.role)?;
        let sp_id = self.identity.create_service_principal(&app_id).await?;
        ctx.state.registration_mut(self.role).sp_id = Some(sp_id.clone());

        let identity = Arc::clone(&self.identity);
        Ok(StepOutcome::Created(RollbackEntry::new(
            format!("delete service principal {} of {}", sp_id, app_id),
            move || async move { identity.delete_service_principal(&sp_id).await },
        )))
    }
}

/// Admin consent may need privileges the operator lacks, so a failure here
/// only produces a warning.
struct RequestAdminConsent {
    identity: Arc<dyn IdentityApi>,
    role: Role,
}

#[async_trait]
impl ProvisionStep<AppPairState> for RequestAdminConsent {
    fn name(&self) -> String {
        format!("request admin consent ({})", self.role.as_str())
    }

    async fn execute(&self, ctx: &mut RunContext<AppPairState>) -> Result<StepOutcome> {
        let app_id = ctx.state.app_id(self.role)?;
        match self.identity.grant_admin_consent(&app_id).await {
            Ok(()) => Ok(StepOutcome::Done),
            Err(e) => Ok(StepOutcome::Warning(format!(
                "admin consent for {} application {} not granted, an administrator must grant it: {}",
                self.role.as_str(),
                app_id,
                e
            ))),
        }
    }
}

struct CreateClientSecret {
    identity: Arc<dyn IdentityApi>,
    project: String,
}

#[async_trait]
impl ProvisionStep<AppPairState> for CreateClientSecret {
    fn name(&self) -> String {
        "create client secret".to_string()
    }

    async fn execute(&self, ctx: &mut RunContext<AppPairState>) -> Result<StepOutcome> {
        let app_id = ctx.state.app_id(Role::Client)?;
        let secret = self
            .identity
            .create_secret(&app_id, &format!("keel-{}", self.project))
            .await?;
        ctx.state.secret = Some(secret);
        Ok(StepOutcome::Done)
    }
}

struct PersistSecrets {
    secrets: Arc<dyn SecretStore>,
    project: String,
}

#[async_trait]
impl ProvisionStep<AppPairState> for PersistSecrets {
    fn name(&self) -> String {
        format!("persist secrets ({})", self.secrets.kind())
    }

    async fn execute(&self, ctx: &mut RunContext<AppPairState>) -> Result<StepOutcome> {
        let state = &ctx.state;
        let tenant_id = state
            .tenant_id
            .clone()
            .ok_or_else(|| ProvisionError::Internal("tenant not resolved".to_string()))?;

        let mut entries = vec![
            ItemField::text(TENANT_ID, tenant_id),
            ItemField::text(Role::Server.id_key(), state.app_id(Role::Server)?),
            ItemField::text(Role::Client.id_key(), state.app_id(Role::Client)?),
        ];
        if let Some(secret) = &state.secret {
            entries.push(ItemField::concealed(CLIENT_SECRET, secret.expose()));
        }

        self.secrets.put(&self.project, &entries).await?;
        ctx.state.persisted_to = Some(self.secrets.kind());
        Ok(StepOutcome::Done)
    }
}

/// Re-reads both registrations after a successful run.
pub struct RegistrationVerifier {
    identity: Arc<dyn IdentityApi>,
    server: AppConfig,
    client: AppConfig,
}

impl RegistrationVerifier {
    pub fn new(identity: Arc<dyn IdentityApi>, config: &IdentityConfig) -> Self {
        Self {
            identity,
            server: config.server.clone(),
            client: config.client.clone(),
        }
    }

    async fn check(&self, role: Role, expected: &AppConfig, app_id: &str) -> Result<Vec<String>> {
        let mut findings = Vec::new();
        let label = role.as_str();

        match self.identity.show_app(app_id).await? {
            None => findings.push(format!("{} application {} not found", label, app_id)),
            Some(app) => {
                for uri in substitute(&expected.redirect_uris, app_id) {
                    if !app.redirect_uris.contains(&uri) {
                        findings.push(format!("{} application is missing redirect URI {}", label, uri));
                    }
                }
                if app.permission_count < expected.min_permissions {
                    findings.push(format!(
                        "{} application has {} permission grants, expected at least {}",
                        label, app.permission_count, expected.min_permissions
                    ));
                }
            }
        }

        if self.identity.show_service_principal(app_id).await?.is_none() {
            findings.push(format!("{} service principal for {} not found", label, app_id));
        }
        Ok(findings)
    }
}

#[async_trait]
impl Verifier<AppPairState> for RegistrationVerifier {
    async fn verify(&self, state: &AppPairState) -> Vec<String> {
        let mut findings = Vec::new();
        for (role, expected) in [(Role::Server, &self.server), (Role::Client, &self.client)] {
            let Some(app_id) = &state.registration(role).app_id else {
                findings.push(format!("{} application was never created", role.as_str()));
                continue;
            };
            match self.check(role, expected, app_id).await {
                Ok(found) => findings.extend(found),
                Err(e) => findings.push(format!("could not verify {} application: {}", role.as_str(), e)),
            }
        }
        findings
    }
}

/// Build the identity run for `project`.
pub fn identity_plan(
    config: &IdentityConfig,
    identity: Arc<dyn IdentityApi>,
    secrets: Arc<dyn SecretStore>,
    project: &str,
) -> Result<Orchestrator<AppPairState>> {
    if config.server.secret {
        return Err(ProvisionError::Config(
            "identity.server: only the client registration carries a secret".to_string(),
        ));
    }

    let mut steps: Vec<Box<dyn ProvisionStep<AppPairState>>> = vec![Box::new(Authenticate {
        identity: Arc::clone(&identity),
    })];

    for (role, app) in [(Role::Server, &config.server), (Role::Client, &config.client)] {
        steps.push(Box::new(CreateApplication {
            identity: Arc::clone(&identity),
            role,
            display_name: app.display_name.clone(),
            audience: config.audience.clone(),
        }));
        steps.push(Box::new(ConfigureApplication {
            identity: Arc::clone(&identity),
            role,
            redirect_uris: app.redirect_uris.clone(),
            identifier_uris: app.identifier_uris.clone(),
        }));
        if !app.permissions.is_empty() {
            steps.push(Box::new(GrantPermissions {
                identity: Arc::clone(&identity),
                role,
                app: app.clone(),
            }));
        }
        steps.push(Box::new(CreateServicePrincipal {
            identity: Arc::clone(&identity),
            role,
        }));
        if !app.permissions.is_empty() {
            steps.push(Box::new(RequestAdminConsent {
                identity: Arc::clone(&identity),
                role,
            }));
        }
    }

    if config.client.secret {
        steps.push(Box::new(CreateClientSecret {
            identity: Arc::clone(&identity),
            project: project.to_string(),
        }));
    }
    steps.push(Box::new(PersistSecrets {
        secrets,
        project: project.to_string(),
    }));

    Ok(Orchestrator::new(steps).with_verifier(Box::new(RegistrationVerifier::new(identity, config))))
}

//! Deployment jobs
//!
//! Every deployment runs as a job: the HTTP layer gets the job id back right
//! away and follows progress through the job log. A failed deployment leaves
//! neither a working directory nor containers behind.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use openapi_client::models::{DeploymentParameter, Template};
use openapi_server::models::{DeployRequest, DeployResult};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::deploy::compose::{self, DEFAULT_IDLE_FLUSH};
use crate::deploy::manifest;
use crate::deploy::params::{host_port, ParamKind};
use crate::deploy::templates::TemplateStore;
use crate::errors::PanelError;
use crate::filesys::dir::Dir;
use crate::jobs::{Job, JobRegistry, JobStatus};
use crate::ports::PortReservation;
use crate::runtime::{ContainerRuntime, COMPOSE_PROJECT_LABEL};
use crate::storage::ledger::PortLedger;
use crate::utils::{is_valid_project_name, normalize_project_name};

pub const COMPOSE_FILE: &str = "docker-compose.yml";
pub const ENV_FILE: &str = ".env";
pub const METADATA_FILE: &str = ".dockpanel.json";

/// Written next to the manifest so a project can be redeployed later
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub project: String,
    #[serde(default)]
    pub template: String,
    pub deployed_at: DateTime<Utc>,
}

/// Deployer options
#[derive(Debug, Clone)]
pub struct Options {
    /// Flush partial compose output lines after this much silence
    pub idle_flush: Duration,
    /// Protocol recorded for reserved deployment ports
    pub reservation_protocol: String,
    /// Type recorded for reserved deployment ports
    pub reservation_type: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            idle_flush: DEFAULT_IDLE_FLUSH,
            reservation_protocol: "TCP".to_string(),
            reservation_type: "App".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeployMode {
    /// Refuses an existing working directory
    NewProject,
    /// Overwrites the existing working directory
    Redeploy,
}

impl DeployMode {
    fn job_kind(self) -> &'static str {
        match self {
            DeployMode::NewProject => "deploy",
            DeployMode::Redeploy => "redeploy",
        }
    }
}

struct DeployPlan {
    project: String,
    template: Option<String>,
    request: DeployRequest,
    mode: DeployMode,
}

/// What a failed deployment has to undo
#[derive(Debug, Default)]
struct Rollback {
    owns_dir: bool,
    compose_started: bool,
}

/// Runs deployments and project removals as jobs
pub struct Deployer {
    options: Options,
    jobs: Arc<JobRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    templates: Arc<TemplateStore>,
    ledger: Arc<PortLedger>,
    projects_dir: Dir,
}

impl Deployer {
    pub fn new(
        options: Options,
        jobs: Arc<JobRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        templates: Arc<TemplateStore>,
        ledger: Arc<PortLedger>,
        projects_dir: Dir,
    ) -> Self {
        Self {
            options,
            jobs,
            runtime,
            templates,
            ledger,
            projects_dir,
        }
    }

    pub fn project_dir(&self, project: &str) -> Dir {
        self.projects_dir.subdir(project)
    }

    /// Deploy a template as a new project. Fails fast when the project
    /// directory already exists.
    pub async fn deploy_template(
        self: &Arc<Self>,
        template: &str,
        request: DeployRequest,
    ) -> Result<Arc<Job>, PanelError> {
        let template = template.trim();
        if template.is_empty() {
            return Err(PanelError::ValidationError("template id is required".to_string()));
        }

        let requested = request.project_name.trim();
        let project = if requested.is_empty() {
            normalize_project_name(template)
        } else {
            normalize_project_name(requested)
        };
        if self.project_dir(&project).exists().await {
            return Err(PanelError::Conflict(format!("project {} already exists", project)));
        }

        Ok(self.spawn_deploy(DeployPlan {
            project,
            template: Some(template.to_string()),
            request,
            mode: DeployMode::NewProject,
        }))
    }

    /// Redeploy an existing project, overwriting its working directory
    pub async fn redeploy(
        self: &Arc<Self>,
        project: &str,
        request: DeployRequest,
    ) -> Result<Arc<Job>, PanelError> {
        self.check_project(project).await?;

        let metadata = self
            .project_dir(project)
            .file(METADATA_FILE)
            .read_json::<ProjectMetadata>()
            .await
            .ok();
        let template = metadata
            .map(|m| m.template)
            .filter(|t| !t.is_empty());
        if template.is_none() && request.compose.trim().is_empty() {
            return Err(PanelError::ValidationError(format!(
                "project {} has no recorded template, a compose manifest is required",
                project
            )));
        }

        Ok(self.spawn_deploy(DeployPlan {
            project: project.to_string(),
            template,
            request,
            mode: DeployMode::Redeploy,
        }))
    }

    /// Tear a project down and release its port reservations
    pub async fn remove_project(self: &Arc<Self>, project: &str) -> Result<Arc<Job>, PanelError> {
        self.check_project(project).await?;

        let job = self.jobs.create_job("remove");
        let deployer = self.clone();
        let task_job = job.clone();
        let project = project.to_string();
        tokio::spawn(async move { deployer.run_remove(task_job, project).await });
        Ok(job)
    }

    async fn check_project(&self, project: &str) -> Result<(), PanelError> {
        if !is_valid_project_name(project) {
            return Err(PanelError::ValidationError(format!(
                "invalid project name: {}",
                project
            )));
        }
        if !self.project_dir(project).exists().await {
            return Err(PanelError::NotFound(format!("project {} not found", project)));
        }
        Ok(())
    }

    fn spawn_deploy(self: &Arc<Self>, plan: DeployPlan) -> Arc<Job> {
        let job = self.jobs.create_job(plan.mode.job_kind());
        let deployer = self.clone();
        let task_job = job.clone();
        tokio::spawn(async move { deployer.run_deploy(task_job, plan).await });
        job
    }

    async fn run_deploy(&self, job: Arc<Job>, plan: DeployPlan) {
        job.set_status(JobStatus::Running);
        info!("Deploying project {} (job {})", plan.project, job.id());

        let mut rollback = Rollback::default();
        match self.execute(&job, &plan, &mut rollback).await {
            Ok(()) => {
                // reservation problems never fail a deployment that is already up
                self.reserve_ports(&job, &plan.project, &plan.request.config).await;
                job.success(format!("Project {} deployed", plan.project));
                let result = serde_json::to_value(DeployResult {
                    app_id: plan.project.clone(),
                    project: plan.project.clone(),
                })
                .ok();
                job.finish(JobStatus::Success, result, "");
                info!("Project {} deployed (job {})", plan.project, job.id());
            }
            Err(e) => {
                error!("Deployment of {} failed: {}", plan.project, e);
                job.error(format!("Deployment failed: {}", e));
                self.rollback(&job, &plan.project, rollback).await;
                job.finish(JobStatus::Failed, None, e.to_string());
            }
        }
    }

    async fn execute(
        &self,
        job: &Job,
        plan: &DeployPlan,
        rollback: &mut Rollback,
    ) -> Result<(), PanelError> {
        let template = match &plan.template {
            Some(key) => {
                job.info(format!("Resolving template {}", key));
                Some(self.templates.resolve(key).await?)
            }
            None => None,
        };

        let compose = if plan.request.compose.trim().is_empty() {
            template.as_ref().map(|t| t.compose.clone()).unwrap_or_default()
        } else {
            plan.request.compose.clone()
        };
        if compose.trim().is_empty() {
            return Err(PanelError::ValidationError("no compose manifest to deploy".to_string()));
        }

        let rendered = if !plan.request.config.is_empty() {
            job.info(format!("Applying {} parameter(s)", plan.request.config.len()));
            manifest::render(&compose, &plan.request.config)?
        } else if !plan.request.env.is_empty() {
            job.info(format!("Injecting {} environment variable(s)", plan.request.env.len()));
            manifest::render_legacy(&compose, &plan.request.env)?
        } else {
            manifest::validate(&compose)?;
            compose
        };

        let dir = self.project_dir(&plan.project);
        match plan.mode {
            DeployMode::NewProject => dir.create_new().await?,
            DeployMode::Redeploy => dir.create().await?,
        }
        rollback.owns_dir = true;

        dir.file(COMPOSE_FILE).write_string(&rendered).await?;
        let dotenv = if plan.request.dotenv.is_empty() {
            template.as_ref().map(|t| t.dotenv.as_str()).unwrap_or_default()
        } else {
            plan.request.dotenv.as_str()
        };
        if !dotenv.is_empty() {
            dir.file(ENV_FILE).write_string(dotenv).await?;
        }
        dir.file(METADATA_FILE)
            .write_json(&ProjectMetadata {
                project: plan.project.clone(),
                template: plan.template.clone().unwrap_or_default(),
                deployed_at: Utc::now(),
            })
            .await?;
        debug!("Wrote manifest for {} to {}", plan.project, dir.path().display());

        if let Some(template) = template {
            self.persist_parameters(job, template, &plan.request.config).await;
        }

        job.info(format!("Starting compose project {}", plan.project));
        rollback.compose_started = true;
        let (output_tx, output_rx) = mpsc::channel(64);
        let (result, ()) = tokio::join!(
            self.runtime.compose_up(dir.path(), &plan.project, output_tx),
            compose::pump_output(output_rx, job, self.options.idle_flush),
        );
        result
    }

    async fn persist_parameters(&self, job: &Job, mut template: Template, config: &[DeploymentParameter]) {
        if config.is_empty() {
            return;
        }
        template.schema = config.to_vec();
        if let Err(e) = self.templates.save(&template).await {
            warn!("Failed to persist parameters of template {}: {}", template.name, e);
            job.warning(format!("Parameters were not saved: {}", e));
        }
    }

    /// Reserve the host ports of port parameters, owned by the project or by
    /// the project container publishing them
    async fn reserve_ports(&self, job: &Job, project: &str, config: &[DeploymentParameter]) {
        let ports: BTreeSet<u16> = config
            .iter()
            .filter(|p| ParamKind::from_param_type(&p.param_type) == ParamKind::Port)
            .filter_map(host_port)
            .filter(|port| *port != 0)
            .collect();
        if ports.is_empty() {
            return;
        }

        let label = format!("{}={}", COMPOSE_PROJECT_LABEL, project);
        let containers = match self.runtime.list_containers(false, Some(&label)).await {
            Ok(containers) => containers,
            Err(e) => {
                debug!("Could not list containers of {}: {}", project, e);
                Vec::new()
            }
        };

        let now = Utc::now();
        let reservations: Vec<PortReservation> = ports
            .iter()
            .map(|&port| {
                let reserved_by = containers
                    .iter()
                    .find(|c| c.ports.iter().any(|p| p.host_port == port))
                    .map(|c| format!("{}/{}", project, c.name))
                    .unwrap_or_else(|| project.to_string());
                PortReservation {
                    port,
                    reserved_by,
                    protocol: self.options.reservation_protocol.clone(),
                    port_type: self.options.reservation_type.clone(),
                    reserved_at: now,
                }
            })
            .collect();

        match self.ledger.replace_owner(project, &reservations) {
            Ok(skipped) => {
                for port in &skipped {
                    warn!("Port {} of {} is reserved by another owner", port, project);
                    job.warning(format!("Port {} is already reserved elsewhere, not reserved", port));
                }
                let reserved: Vec<String> = ports
                    .iter()
                    .copied()
                    .filter(|port| !skipped.contains(port))
                    .map(|port| port.to_string())
                    .collect();
                if !reserved.is_empty() {
                    job.info(format!("Reserved port(s) {}", reserved.join(", ")));
                }
            }
            Err(e) => {
                warn!("Failed to reserve ports for {}: {}", project, e);
                job.warning(format!("Ports were not reserved: {}", e));
            }
        }
    }

    async fn rollback(&self, job: &Job, project: &str, rollback: Rollback) {
        let dir = self.project_dir(project);
        if rollback.compose_started {
            job.info(format!("Rolling back project {}", project));
            if let Err(e) = self.runtime.compose_down(dir.path(), project).await {
                warn!("compose down for {} failed: {}", project, e);
            }
            self.remove_project_containers(project).await;
        }
        if rollback.owns_dir {
            if let Err(e) = dir.delete().await {
                warn!("Failed to delete {}: {}", dir.path().display(), e);
            }
        }
    }

    /// Force-remove every container labeled with the compose project
    async fn remove_project_containers(&self, project: &str) -> usize {
        let label = format!("{}={}", COMPOSE_PROJECT_LABEL, project);
        let containers = match self.runtime.list_containers(true, Some(&label)).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("Could not list containers of {}: {}", project, e);
                return 0;
            }
        };

        let mut removed = 0;
        for container in containers {
            match self.runtime.remove_container(&container.id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove container {}: {}", container.name, e),
            }
        }
        removed
    }

    async fn run_remove(&self, job: Arc<Job>, project: String) {
        job.set_status(JobStatus::Running);
        info!("Removing project {} (job {})", project, job.id());

        match self.remove(&job, &project).await {
            Ok(()) => {
                job.success(format!("Project {} removed", project));
                job.finish(JobStatus::Success, Some(serde_json::json!({ "project": project })), "");
            }
            Err(e) => {
                error!("Removal of {} failed: {}", project, e);
                job.error(format!("Removal failed: {}", e));
                job.finish(JobStatus::Failed, None, e.to_string());
            }
        }
    }

    async fn remove(&self, job: &Job, project: &str) -> Result<(), PanelError> {
        let dir = self.project_dir(project);
        if dir.file(COMPOSE_FILE).exists().await {
            job.info(format!("Stopping compose project {}", project));
            if let Err(e) = self.runtime.compose_down(dir.path(), project).await {
                job.warning(format!("compose down failed: {}", e));
            }
        }

        let removed = self.remove_project_containers(project).await;
        if removed > 0 {
            job.info(format!("Removed {} container(s)", removed));
        }

        let released = self.ledger.release_owner(project)?;
        if released > 0 {
            job.info(format!("Released {} port reservation(s)", released));
        }

        dir.delete().await
    }
}

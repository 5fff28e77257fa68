//! Batch executor: runs planned sub-requests through the phase scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use rsrest_domain::{DomainError, JobError, RequestHandle, SubResponse, Verb};

use super::builder::{plan, PlannedRequest, Target};
use super::types::{BatchBody, BatchOutcome};
use super::unit::UnitOfWork;
use crate::config::BatchSettings;
use crate::phase::{run_phase_synced_settle, BeforePhaseHook, Job, PhaseSyncer, Settlement};
use crate::routes::{HandlerCall, ResourceHandler, RouteTable};

/// Runs batch requests against a route table.
///
/// A flat body is one scheduler run bounded by `concurrency`. A grouped body
/// runs its groups one after another, each as its own run, so a failure in
/// one group never cascades into the next.
pub struct BatchExecutor<C> {
    routes: Arc<RouteTable<C>>,
    settings: BatchSettings,
    hooks: Vec<Arc<dyn BeforePhaseHook>>,
    unit: Option<Arc<dyn UnitOfWork<C>>>,
}

impl<C: Send + Sync + 'static> BatchExecutor<C> {
    pub fn new(routes: Arc<RouteTable<C>>, settings: BatchSettings) -> Self {
        Self {
            routes,
            settings,
            hooks: Vec::new(),
            unit: None,
        }
    }

    /// Adds a hook run before every phase of every group.
    pub fn with_hook(mut self, hook: Arc<dyn BeforePhaseHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Runs every group (and every dispatched request) inside `unit`.
    pub fn with_unit_of_work(mut self, unit: Arc<dyn UnitOfWork<C>>) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn routes(&self) -> &Arc<RouteTable<C>> {
        &self.routes
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Validates and executes a batch body.
    ///
    /// `root` is the batch request itself; its href is the base for relative
    /// sub-request hrefs. Structural problems are returned as an error before
    /// any sub-request runs.
    pub async fn execute(
        &self,
        root: &RequestHandle,
        body: &Value,
        shared: Arc<C>,
    ) -> Result<BatchOutcome, DomainError> {
        let parsed = BatchBody::parse(body, self.settings.max_batch_size)?;
        let grouped = matches!(parsed, BatchBody::Grouped(_));
        let leaves = parsed.leaf_count();
        let planned = plan(&self.routes, root.href(), parsed.into_groups())?;

        info!(
            root = %root.id(),
            leaves,
            groups = planned.groups.len(),
            concurrency = self.settings.concurrency,
            "executing batch"
        );

        let results = if grouped {
            self.run_groups(root, planned.groups, shared).await
        } else {
            let mut results = Vec::with_capacity(leaves);
            for group in planned.groups {
                let group_request = group_request(root, &group);
                results.extend(self.run_group(&group_request, group, Arc::clone(&shared)).await);
            }
            results
        };

        let outcome = BatchOutcome::new(results, planned.warnings);
        debug!(root = %root.id(), status = outcome.status, "batch finished");
        Ok(outcome)
    }

    /// Runs one sub-request on its own, outside of any batch.
    ///
    /// `request` is the incoming request; it becomes the root of a one-job run.
    pub async fn dispatch(&self, request: &RequestHandle, body: Value, shared: Arc<C>) -> SubResponse {
        let Some(found) = self.routes.resolve(request.verb(), request.href()) else {
            let err = DomainError::route_not_found(request.verb().as_str(), request.href());
            return SubResponse::from_error(&err.into());
        };
        let planned = PlannedRequest {
            verb: request.verb(),
            href: request.href().to_string(),
            body,
            target: Target::Route {
                handler: found.handler,
                params: found.params,
            },
        };
        self.run_group(request, vec![planned], shared)
            .await
            .pop()
            .unwrap_or_else(|| SubResponse::from_error(&JobError::internal("request not settled")))
    }

    async fn run_groups(
        &self,
        root: &RequestHandle,
        groups: Vec<Vec<PlannedRequest<C>>>,
        shared: Arc<C>,
    ) -> Vec<SubResponse> {
        let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
        let runner = Arc::new(self.runner());

        let jobs: Vec<Job<Vec<SubResponse>>> = groups
            .into_iter()
            .map(|group| {
                let request = group_request(root, &group);
                let args = (Arc::clone(&runner), group, Arc::clone(&shared));
                Job::new(request, args, |mut syncer, (runner, group, shared)| async move {
                    // Waiting for the first wake keeps groups strictly sequential.
                    syncer.phase().await?;
                    let group_request = syncer.request().clone();
                    Ok(runner.run(&group_request, group, shared).await)
                })
            })
            .collect();

        let settled = run_phase_synced_settle(root, jobs, 1, &[]).await;
        settled
            .into_iter()
            .zip(sizes)
            .flat_map(|(settlement, size)| match settlement {
                Settlement::Fulfilled(responses) => responses,
                Settlement::Rejected(err) => vec![SubResponse::from_error(&err); size],
            })
            .collect()
    }

    async fn run_group(
        &self,
        group_request: &RequestHandle,
        group: Vec<PlannedRequest<C>>,
        shared: Arc<C>,
    ) -> Vec<SubResponse> {
        self.runner().run(group_request, group, shared).await
    }

    fn runner(&self) -> GroupRunner<C> {
        GroupRunner {
            concurrency: self.settings.concurrency,
            hooks: self.hooks.clone(),
            unit: self.unit.clone(),
        }
    }
}

/// Request handle a group runs under: a child of the batch request that is
/// read-only when every member is.
fn group_request<C>(root: &RequestHandle, group: &[PlannedRequest<C>]) -> RequestHandle {
    let read_only = group.iter().all(PlannedRequest::is_read_only);
    root.arena().child(root, root.verb(), root.href(), read_only)
}

/// Everything needed to run one group, detached from the executor's borrow.
struct GroupRunner<C> {
    concurrency: usize,
    hooks: Vec<Arc<dyn BeforePhaseHook>>,
    unit: Option<Arc<dyn UnitOfWork<C>>>,
}

impl<C: Send + Sync + 'static> GroupRunner<C> {
    async fn run(
        &self,
        group_request: &RequestHandle,
        group: Vec<PlannedRequest<C>>,
        shared: Arc<C>,
    ) -> Vec<SubResponse> {
        if let Some(unit) = &self.unit {
            if let Err(err) = unit.begin(&shared, group_request).await {
                warn!(group = %group_request.id(), error = %err, "could not begin group");
                return vec![SubResponse::from_error(&JobError::from(err)); group.len()];
            }
        }

        let jobs: Vec<Job<SubResponse>> = group
            .into_iter()
            .map(|planned| leaf_job(group_request, planned, Arc::clone(&shared)))
            .collect();

        let settled = run_phase_synced_settle(group_request, jobs, self.concurrency, &self.hooks).await;
        let failed = settled.iter().any(|settlement| !settlement.is_fulfilled());
        let responses: Vec<SubResponse> = settled
            .into_iter()
            .map(|settlement| match settlement {
                Settlement::Fulfilled(response) => response,
                Settlement::Rejected(err) => SubResponse::from_error(&err),
            })
            .collect();

        let Some(unit) = &self.unit else {
            return responses;
        };
        if failed {
            debug!(group = %group_request.id(), "rolling back group");
            unit.rollback(&shared, group_request).await;
            return responses;
        }
        match unit.commit(&shared, group_request).await {
            Ok(()) => responses,
            Err(err) => {
                warn!(group = %group_request.id(), error = %err, "commit failed");
                vec![SubResponse::from_error(&JobError::from(err)); responses.len()]
            }
        }
    }
}

fn leaf_job<C: Send + Sync + 'static>(
    parent: &RequestHandle,
    planned: PlannedRequest<C>,
    shared: Arc<C>,
) -> Job<SubResponse> {
    let read_only = planned.is_read_only();
    let request = parent
        .arena()
        .child(parent, planned.verb, planned.href, read_only);

    match planned.target {
        Target::Route { handler, params } => Job::new(
            request,
            (handler, params, planned.body, shared),
            |syncer, (handler, params, body, shared)| async move {
                let call = HandlerCall {
                    request: syncer.request().clone(),
                    params,
                    body,
                    shared,
                };
                handler.handle(syncer, call).await
            },
        ),
        Target::NotFound(err) => Job::new(request, err, |_syncer, err| async move {
            Err(JobError::from(err))
        }),
    }
}

/// Route entry standing for the batch endpoint itself.
///
/// Registering it lets the builder reject sub-requests that target the
/// batch endpoint under any alias the route table knows.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchRoute;

#[async_trait]
impl<C: Send + Sync + 'static> ResourceHandler<C> for BatchRoute {
    async fn handle(&self, syncer: PhaseSyncer, _call: HandlerCall<C>) -> Result<SubResponse, JobError> {
        Err(DomainError::batch_in_batch(syncer.request().href()).into())
    }

    fn is_batch(&self) -> bool {
        true
    }
}

/// Registers [`BatchRoute`] for `POST path`.
pub fn register_batch_route<C: Send + Sync + 'static>(
    routes: &mut RouteTable<C>,
    path: &str,
) -> Result<(), crate::routes::RouteError> {
    routes.add(Verb::Post, path, Arc::new(BatchRoute))
}

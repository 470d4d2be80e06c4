//! Resource lifecycle tracking and convergence.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use etcdform_common::{Error, KeyPath, Result};

use crate::plan::Plan;
use crate::resource::Resource;

/// Lifecycle phase of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Not read yet.
    #[default]
    Unknown,
    /// Read and found absent, or deleted.
    Absent,
    /// Read and found present, or created.
    Present,
}

/// What a convergence did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
            Action::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// Locally tracked state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedResource<S> {
    pub resource_type: String,
    pub path: KeyPath,
    phase: Phase,
    state: Option<S>,
    /// Last error message if the last convergence failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Number of consecutive failed convergences.
    #[serde(default)]
    pub failure_count: u32,
}

impl<S> TrackedResource<S> {
    pub fn new(resource_type: impl Into<String>, path: KeyPath) -> Self {
        Self {
            resource_type: resource_type.into(),
            path,
            phase: Phase::Unknown,
            state: None,
            last_error: None,
            failure_count: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> Option<&S> {
        self.state.as_ref()
    }

    /// Record the result of a read. Allowed from any phase.
    pub fn mark_read(&mut self, observed: Option<S>) {
        self.phase = if observed.is_some() {
            Phase::Present
        } else {
            Phase::Absent
        };
        self.state = observed;
    }

    /// Absent -> Present.
    pub fn mark_created(&mut self, state: S) -> Result<()> {
        self.transition(Phase::Absent, "create")?;
        self.phase = Phase::Present;
        self.state = Some(state);
        self.clear_failure();
        Ok(())
    }

    /// Present -> Present.
    pub fn mark_updated(&mut self, state: S) -> Result<()> {
        self.transition(Phase::Present, "update")?;
        self.state = Some(state);
        self.clear_failure();
        Ok(())
    }

    /// Present -> Absent.
    pub fn mark_deleted(&mut self) -> Result<()> {
        self.transition(Phase::Present, "delete")?;
        self.phase = Phase::Absent;
        self.state = None;
        self.clear_failure();
        Ok(())
    }

    /// Record a failure. Phase and state keep their values.
    pub fn mark_failed(&mut self, error: &Error) {
        self.failure_count += 1;
        self.last_error = Some(error.to_string());
    }

    fn transition(&self, from: Phase, action: &str) -> Result<()> {
        if self.phase != from {
            return Err(Error::InvalidInput(format!(
                "{}: cannot {} a resource in phase {:?}",
                self.path, action, self.phase
            )));
        }
        Ok(())
    }

    fn clear_failure(&mut self) {
        self.failure_count = 0;
        self.last_error = None;
    }
}

impl<S: Serialize> TrackedResource<S> {
    /// Erase the state type for persistence.
    pub fn to_value(&self) -> Result<TrackedResource<Value>> {
        Ok(TrackedResource {
            resource_type: self.resource_type.clone(),
            path: self.path.clone(),
            phase: self.phase,
            state: self.state.as_ref().map(serde_json::to_value).transpose()?,
            last_error: self.last_error.clone(),
            failure_count: self.failure_count,
        })
    }
}

impl TrackedResource<Value> {
    /// Restore the typed state.
    pub fn decode<S: DeserializeOwned>(&self) -> Result<TrackedResource<S>> {
        let state = self
            .state
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::Serialization(format!("{}: {}", self.path, e)))?;
        Ok(TrackedResource {
            resource_type: self.resource_type.clone(),
            path: self.path.clone(),
            phase: self.phase,
            state,
            last_error: self.last_error.clone(),
            failure_count: self.failure_count,
        })
    }
}

async fn refresh<R: Resource + ?Sized>(
    resource: &R,
    tracked: &mut TrackedResource<R::State>,
    desired: Option<&R::Config>,
) -> Result<()> {
    if let Some(config) = desired {
        let path = resource.path(config)?;
        if path != tracked.path {
            return Err(Error::InvalidInput(format!(
                "{}: configuration manages {}",
                tracked.path, path
            )));
        }
    }

    let observed = match resource.read(&tracked.path).await {
        Ok(observed) => observed,
        Err(e) => {
            tracked.mark_failed(&e);
            return Err(e.for_path(&tracked.path));
        }
    };
    debug!(path = %tracked.path, present = observed.is_some(), "refreshed");

    // Only resources this state created or adopted are updated in place.
    if let (Some(_), Some(config)) = (&observed, desired) {
        if tracked.phase() != Phase::Present && !resource.overwrites_existing(config) {
            let e = Error::AlreadyExists(format!(
                "{} exists but is not managed by this state",
                tracked.path
            ));
            tracked.mark_failed(&e);
            return Err(e);
        }
    }

    tracked.mark_read(observed);
    Ok(())
}

/// Best-effort read after a failed create, so that whatever the create
/// left behind is tracked instead of being reported as foreign next time.
async fn observe_partial_create<R: Resource + ?Sized>(
    resource: &R,
    tracked: &mut TrackedResource<R::State>,
) {
    match resource.read(&tracked.path).await {
        Ok(Some(observed)) => {
            debug!(path = %tracked.path, "failed create left the resource behind");
            tracked.mark_read(Some(observed));
        }
        Ok(None) => {}
        Err(e) => debug!(path = %tracked.path, error = %e, "could not re-read after failure"),
    }
}

/// Read the resource and compute the plan that would converge it.
///
/// `desired = None` plans the deletion of the resource.
///
/// # Errors
/// - `AlreadyExists` when the resource exists but is not tracked as present
///   and its configuration does not allow overwriting
pub async fn plan_for<R: Resource + ?Sized>(
    resource: &R,
    tracked: &mut TrackedResource<R::State>,
    desired: Option<&R::Config>,
) -> Result<Plan> {
    refresh(resource, tracked, desired).await?;
    if tracked.state().is_none() && desired.is_none() {
        return Ok(Plan::new(resource.type_name(), tracked.path.clone()));
    }
    resource.plan(tracked.state(), desired)
}

/// Read the resource and converge it to `desired`.
///
/// The store is always read first, so updates and deletes are guarded by
/// the version observed here. On failure the tracked state keeps the
/// observed value and records the error.
pub async fn converge<R: Resource + ?Sized>(
    resource: &R,
    tracked: &mut TrackedResource<R::State>,
    desired: Option<&R::Config>,
) -> Result<Action> {
    let plan = plan_for(resource, tracked, desired).await?;
    if plan.is_empty() {
        return Ok(Action::Unchanged);
    }

    let result = match (tracked.state().cloned(), desired) {
        (None, Some(config)) => match resource.create(config).await {
            Ok(state) => tracked.mark_created(state).map(|_| Action::Created),
            Err(e) => {
                if !matches!(e, Error::AlreadyExists(_)) {
                    observe_partial_create(resource, tracked).await;
                }
                Err(e)
            }
        },
        (Some(prior), Some(config)) => match resource.update(&prior, config).await {
            Ok(state) => tracked.mark_updated(state).map(|_| Action::Updated),
            Err(e) => Err(e),
        },
        (Some(prior), None) => match resource.delete(&prior).await {
            Ok(()) => tracked.mark_deleted().map(|_| Action::Deleted),
            Err(e) => Err(e),
        },
        (None, None) => Ok(Action::Unchanged),
    };

    if let Err(e) = &result {
        warn!(path = %tracked.path, error = %e, "convergence failed");
        tracked.mark_failed(e);
    }
    result
}

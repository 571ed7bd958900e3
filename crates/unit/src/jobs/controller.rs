//! Controller jobs: a parent that owns exactly one automation child and swaps
//! it when its `automation` attribute is set.
//!
//! A swap builds the replacement first. If the new spec is rejected the old
//! automation keeps running untouched; if the replacement then fails to
//! start, the old automation is started again from its spec.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, SetError};
use crate::job::{Job, JobContext};
use crate::jobs::automation::AutomationSpec;
use crate::settings::{Datatype, SettingSpec};
use crate::state::JobState;

static CONTROLLER_SETTINGS: [SettingSpec; 2] = [
    SettingSpec::new("automation", Datatype::Json).settable(),
    SettingSpec::new("automation_name", Datatype::String),
];

/// Ties a controller name to the automation job it runs.
pub trait ControllerKind: Send + 'static {
    const NAME: &'static str;

    type Automation: Job;

    /// Built from `spec`, or an `InvalidArgument` naming what is wrong.
    fn build(spec: &AutomationSpec, config: &Config) -> Result<Self::Automation>;
}

pub struct Controller<K: ControllerKind> {
    spec: AutomationSpec,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ControllerKind> Controller<K> {
    pub fn new(spec: AutomationSpec) -> Self {
        Self {
            spec,
            _kind: PhantomData,
        }
    }

    /// Start `automation` as the child, asleep if the controller is.
    async fn adopt(ctx: &mut JobContext, automation: K::Automation) -> Result<()> {
        let child = ctx.add_child(automation).await?;
        if ctx.state() == JobState::Sleeping {
            child.set_state(JobState::Sleeping).await?;
        }
        Ok(())
    }

    fn publish_spec(&self, ctx: &mut JobContext) -> Result<()> {
        ctx.settings
            .set("automation", serde_json::to_value(&self.spec)?)?;
        ctx.settings
            .set("automation_name", self.spec.automation_name.clone())?;
        Ok(())
    }
}

#[async_trait]
impl<K: ControllerKind> Job for Controller<K> {
    const NAME: &'static str = K::NAME;

    fn settings() -> &'static [SettingSpec] {
        &CONTROLLER_SETTINGS
    }

    async fn on_init(&mut self, ctx: &mut JobContext) -> Result<()> {
        let automation = K::build(&self.spec, &ctx.config)?;
        ctx.add_child(automation).await?;
        self.publish_spec(ctx)
    }

    async fn on_ready(&mut self, ctx: &mut JobContext) -> Result<()> {
        if let Some(child) = ctx.child(K::Automation::NAME) {
            if child.state() == JobState::Sleeping {
                child.set_state(JobState::Ready).await?;
            }
        }
        Ok(())
    }

    async fn on_sleeping(&mut self, ctx: &mut JobContext) -> Result<()> {
        if let Some(child) = ctx.child(K::Automation::NAME) {
            child.set_state(JobState::Sleeping).await?;
        }
        Ok(())
    }

    async fn on_set(&mut self, ctx: &mut JobContext, name: &str, value: Value) -> Result<()> {
        if name != "automation" {
            ctx.settings.set(name, value)?;
            return Ok(());
        }
        let spec: AutomationSpec =
            serde_json::from_value(value).map_err(|e| SetError::OutOfRange {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        let automation = K::build(&spec, &ctx.config)?;

        ctx.remove_child(K::Automation::NAME).await?;
        if let Err(e) = Self::adopt(ctx, automation).await {
            warn!(
                to = %spec.automation_name,
                "automation failed to start, restoring {}: {e}",
                self.spec.automation_name
            );
            let previous = K::build(&self.spec, &ctx.config)?;
            Self::adopt(ctx, previous).await?;
            return Err(e);
        }
        info!(
            from = %self.spec.automation_name,
            to = %spec.automation_name,
            "automation swapped"
        );
        self.spec = spec;
        self.publish_spec(ctx)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Job runtime.
//!
//! A job is a small [`Job`] implementation (its attribute table and hooks)
//! driven by [`JobRuntime`], which owns everything generic: the identity
//! claim, the connection and its last will, the state machine, the control
//! loop schedule, remote sets, dodging and the ordered shutdown.
//!
//! Each running job is one actor task. Inbound messages, handle commands,
//! tick deadlines and dodge deadlines are all served from one `select!`, so a
//! job's state is only ever touched by one of them at a time. Attribute
//! changes are published once per event, after it has been handled.
//!
//! A hook that runs for a long time (a pump sequence) can look at its
//! [`JobContext::interruption`] between safe steps: that takes in whatever
//! arrived meanwhile and reports a pending pause or stop, which the actor
//! applies as soon as the hook returns.
//!
//! If the connection drops and comes back, the broker has already published
//! the job's will. The job then announces itself again: `$properties`, every
//! attribute and its current state.

use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::cache::Caches;
use crate::cluster::ClusterView;
use crate::config::Config;
use crate::error::{JobError, Result};
use crate::hardware::SharedHardware;
use crate::kernel::{
    instant_at, now_unix_ms, run_tick, DodgePhase, DodgeSchedule, FailurePolicy, Schedule,
};
use crate::pubsub::{
    ConnectOptions, LastWill, Message, Qos, SharedConnector, SharedTransport,
};
use crate::settings::{Registry, SettingSpec};
use crate::state::JobState;
use crate::supervisor::{JobMetadata, JobRegistry};
use crate::topic::{JobIdentity, TopicPath, INVENTORY, LATEST_EXPERIMENT, PROPERTIES, STATE};

/// Pending handle commands per job.
const COMMAND_CAPACITY: usize = 32;

/// How often a dodging job re-reads its target's schedule.
const DODGE_POLL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Job trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Job: Send + Sized + 'static {
    const NAME: &'static str;

    fn settings() -> &'static [SettingSpec];

    /// Control-loop period; `None` for purely reactive jobs.
    fn period(&self) -> Option<Duration> {
        None
    }

    /// Longest a tick may run before it counts as failed.
    fn tick_budget(&self) -> Option<Duration> {
        self.period()
    }

    /// Extra topic filters, beyond the job's own `set` topics.
    fn subscriptions(&self, _identity: &JobIdentity) -> Vec<String> {
        Vec::new()
    }

    /// Job whose sampling schedule this one steps aside for.
    fn dodge_target(&self) -> Option<&'static str> {
        None
    }

    /// Clear retained attributes on a clean disconnect.
    fn clear_on_disconnect(&self) -> bool {
        false
    }

    /// Acquire hardware and calibrations. Nothing has been published yet.
    async fn on_init(&mut self, _ctx: &mut JobContext) -> Result<()> {
        Ok(())
    }

    /// Entered `Ready`, at start and on every resume.
    async fn on_ready(&mut self, _ctx: &mut JobContext) -> Result<()> {
        Ok(())
    }

    async fn on_sleeping(&mut self, _ctx: &mut JobContext) -> Result<()> {
        Ok(())
    }

    /// Children are already gone; release hardware here.
    async fn on_disconnected(&mut self, _ctx: &mut JobContext) -> Result<()> {
        Ok(())
    }

    async fn tick(&mut self, _ctx: &mut JobContext) -> Result<()> {
        Ok(())
    }

    /// A validated remote set. The default stores the value.
    async fn on_set(&mut self, ctx: &mut JobContext, name: &str, value: Value) -> Result<()> {
        ctx.settings.set(name, value)?;
        Ok(())
    }

    /// A message on one of [`Job::subscriptions`].
    async fn on_message(&mut self, _ctx: &mut JobContext, _msg: &Message) -> Result<()> {
        Ok(())
    }

    async fn before_dodge(&mut self, _ctx: &mut JobContext) -> Result<()> {
        Ok(())
    }

    async fn after_dodge(&mut self, _ctx: &mut JobContext) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Environment and context
// ---------------------------------------------------------------------------

/// What every job on a unit is started with. Cheap to clone.
#[derive(Clone)]
pub struct JobEnv {
    pub unit: String,
    pub experiment: String,
    pub connector: SharedConnector,
    pub caches: Caches,
    pub config: Arc<Config>,
    pub cluster: ClusterView,
    pub hardware: SharedHardware,
}

impl JobEnv {
    pub fn identity(&self, job: &str) -> JobIdentity {
        JobIdentity::new(self.unit.clone(), self.experiment.clone(), job)
    }

    /// Start a top-level job.
    pub async fn start<J: Job>(&self, job: J) -> Result<JobHandle> {
        JobRuntime::start(self, job, None).await
    }
}

/// A job's view of its runtime, passed to every hook.
pub struct JobContext {
    pub identity: JobIdentity,
    pub settings: Registry,
    pub transport: SharedTransport,
    pub caches: Caches,
    pub config: Arc<Config>,
    pub cluster: ClusterView,
    pub hardware: SharedHardware,
    pub parent: Option<JobIdentity>,
    env: JobEnv,
    children: Vec<JobHandle>,
    state: JobState,
    stop: Option<String>,
    mailbox: Mailbox,
}

impl JobContext {
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Take in what arrived while the current hook ran and report a pending
    /// request to pause (`Sleeping`) or stop (`Disconnected`, or `Lost` if
    /// the connection closed). Nothing is applied here; the runtime handles
    /// everything received, in order, once the hook returns.
    pub fn interruption(&mut self) -> Option<JobState> {
        self.mailbox.drain();
        let mut found = None;
        for ev in &self.mailbox.deferred {
            let requested = match ev {
                Event::Command(Command::SetState(s, _)) => Some(*s),
                Event::Command(Command::Disconnect) => Some(JobState::Disconnected),
                Event::Message(msg) => state_request(&self.identity, &self.cluster, msg),
                Event::Closed => Some(JobState::Lost),
                Event::Command(Command::Set { .. }) | Event::Reconnected => None,
            };
            match requested {
                Some(s @ (JobState::Disconnected | JobState::Lost)) => return Some(s),
                Some(JobState::Sleeping) => found = Some(JobState::Sleeping),
                Some(JobState::Ready) => found = None,
                _ => {}
            }
        }
        found
    }

    pub fn topic(&self, attribute: &str) -> String {
        self.identity.topic(attribute)
    }

    /// Retained publish under this job.
    pub async fn publish(&self, attribute: &str, payload: impl Into<String>) -> Result<()> {
        self.transport
            .publish_retained(&self.topic(attribute), &payload.into())
            .await?;
        Ok(())
    }

    /// Non-retained publish of an event under this unit and experiment.
    pub async fn publish_event(&self, name: &str, payload: &impl serde::Serialize) -> Result<()> {
        let topic = format!("{}/{}/{name}", self.identity.unit, self.identity.experiment);
        self.transport
            .publish(&topic, serde_json::to_vec(payload)?, false, Qos::AtLeastOnce)
            .await?;
        Ok(())
    }

    /// Start `job` as a child. It is disconnected before this job is.
    pub async fn add_child<J: Job>(&mut self, job: J) -> Result<JobHandle> {
        let handle = JobRuntime::start(&self.env, job, Some(self.identity.clone())).await?;
        self.children.push(handle.clone());
        Ok(handle)
    }

    pub fn child(&self, job: &str) -> Option<&JobHandle> {
        self.children.iter().find(|c| c.identity.job == job)
    }

    /// Disconnect a child and wait for it. Returns whether one was running.
    pub async fn remove_child(&mut self, job: &str) -> Result<bool> {
        let Some(pos) = self.children.iter().position(|c| c.identity.job == job) else {
            return Ok(false);
        };
        let child = self.children.remove(pos);
        child.disconnect().await?;
        Ok(true)
    }

    /// Ask the runtime to disconnect this job once the current hook returns.
    pub fn request_disconnect(&mut self, reason: impl Into<String>) {
        self.stop.get_or_insert(reason.into());
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum Command {
    SetState(JobState, oneshot::Sender<Result<()>>),
    Set {
        name: String,
        payload: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect,
}

#[derive(Clone)]
pub struct JobHandle {
    identity: JobIdentity,
    client_id: String,
    state: watch::Receiver<JobState>,
    commands: mpsc::Sender<Command>,
}

impl JobHandle {
    pub fn identity(&self) -> &JobIdentity {
        &self.identity
    }

    /// Broker client id of the job's connection.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<JobState> {
        self.state.clone()
    }

    /// Local equivalent of a remote set on `$state`.
    pub async fn set_state(&self, state: JobState) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SetState(state, reply))
            .await
            .map_err(|_| JobError::Stopped)?;
        rx.await.map_err(|_| JobError::Stopped)?
    }

    /// Local equivalent of a remote set on `<attr>/set`.
    pub async fn set(&self, name: &str, payload: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Set {
                name: name.to_string(),
                payload: payload.into(),
                reply,
            })
            .await
            .map_err(|_| JobError::Stopped)?;
        rx.await.map_err(|_| JobError::Stopped)?
    }

    /// Disconnect and wait until the job has fully shut down.
    pub async fn disconnect(&self) -> Result<()> {
        // A closed channel means the job is already on its way out.
        let _ = self.commands.send(Command::Disconnect).await;
        self.wait().await;
        Ok(())
    }

    /// Wait for a terminal state.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state.clone();
        let done = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        done.unwrap_or_else(|_| *rx.borrow())
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("identity", &self.identity)
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct JobRuntime;

impl JobRuntime {
    /// Run `Init` and enter `Ready`, then hand the job to its actor task.
    ///
    /// Init failures (duplicate identity, absent hardware, missing
    /// calibration) are logged once and returned; the job is then
    /// `Disconnected` and has released everything it took.
    pub async fn start<J: Job>(env: &JobEnv, job: J, parent: Option<JobIdentity>) -> Result<JobHandle> {
        let identity = env.identity(J::NAME);
        let span = info_span!("job", job = %identity.job);
        Self::start_inner(env, job, parent, identity)
            .instrument(span)
            .await
    }

    async fn start_inner<J: Job>(
        env: &JobEnv,
        job: J,
        parent: Option<JobIdentity>,
        identity: JobIdentity,
    ) -> Result<JobHandle> {
        let registry = JobRegistry::new(env.caches.intermittent.clone());
        if let Err(e) = registry.claim(&identity, &JobMetadata::new(parent.as_ref())).await {
            error!("{e}");
            return Err(e);
        }

        let client_id = format!(
            "{}_{}_{}",
            identity.unit, identity.job, identity.experiment
        );
        let will = LastWill {
            topic: identity.topic(STATE),
            payload: JobState::Lost.as_str().as_bytes().to_vec(),
            qos: Qos::AtLeastOnce,
            retain: true,
        };
        let conn = match env
            .connector
            .connect(ConnectOptions::new(client_id.clone()).with_last_will(will))
            .await
        {
            Ok(c) => c,
            Err(e) => {
                let e = JobError::from(e);
                error!("failed to connect: {e}");
                if let Err(re) = registry.release(&identity).await {
                    warn!("failed to release job claim: {re}");
                }
                return Err(e);
            }
        };

        let (state_tx, state_rx) = watch::channel(JobState::Init);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let ctx = JobContext {
            identity: identity.clone(),
            settings: Registry::new(J::settings()),
            transport: conn.transport,
            caches: env.caches.clone(),
            config: Arc::clone(&env.config),
            cluster: env.cluster.clone(),
            hardware: Arc::clone(&env.hardware),
            parent,
            env: env.clone(),
            children: Vec::new(),
            state: JobState::Init,
            stop: None,
            mailbox: Mailbox::new(conn.inbox, cmd_rx, conn.reconnects),
        };
        let mut actor = Actor {
            dodger: job.dodge_target().map(Dodger::new),
            job,
            ctx,
            state_tx,
            registry,
            schedule: None,
            failures: FailurePolicy::default(),
        };

        if let Err(e) = actor.init().await {
            error!("failed to start: {e}");
            actor.shutdown(Exit::Requested(e.to_string())).await;
            return Err(e);
        }

        tokio::spawn(actor.run().in_current_span());
        Ok(JobHandle {
            identity,
            client_id,
            state: state_rx,
            commands: cmd_tx,
        })
    }
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

enum Event {
    Command(Command),
    Message(Message),
    Reconnected,
    Closed,
}

/// Everything that reaches a job from outside: handle commands, bus
/// messages and reconnects. Events taken in early by
/// [`JobContext::interruption`] wait in `deferred` and are served first.
struct Mailbox {
    inbox: mpsc::Receiver<Message>,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    reconnects: watch::Receiver<u64>,
    reconnects_open: bool,
    deferred: VecDeque<Event>,
}

impl Mailbox {
    fn new(
        inbox: mpsc::Receiver<Message>,
        commands: mpsc::Receiver<Command>,
        reconnects: watch::Receiver<u64>,
    ) -> Self {
        Self {
            inbox,
            commands,
            commands_open: true,
            reconnects,
            reconnects_open: true,
            deferred: VecDeque::new(),
        }
    }

    /// Cancel safe: nothing is taken from a queue unless it is returned.
    async fn next(&mut self) -> Event {
        if let Some(ev) = self.deferred.pop_front() {
            return ev;
        }
        loop {
            tokio::select! {
                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(cmd) => return Event::Command(cmd),
                    None => self.commands_open = false,
                },
                msg = self.inbox.recv() => {
                    return msg.map_or(Event::Closed, Event::Message);
                }
                changed = self.reconnects.changed(), if self.reconnects_open => match changed {
                    Ok(()) => return Event::Reconnected,
                    Err(_) => self.reconnects_open = false,
                },
            }
        }
    }

    /// Move everything already queued into `deferred`, without waiting.
    fn drain(&mut self) {
        if self.deferred.iter().any(|e| matches!(e, Event::Closed)) {
            return;
        }
        while self.commands_open {
            match self.commands.try_recv() {
                Ok(cmd) => self.deferred.push_back(Event::Command(cmd)),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => self.commands_open = false,
            }
        }
        if self.reconnects_open && self.reconnects.has_changed().unwrap_or(false) {
            self.reconnects.borrow_and_update();
            self.deferred.push_back(Event::Reconnected);
        }
        loop {
            match self.inbox.try_recv() {
                Ok(msg) => self.deferred.push_back(Event::Message(msg)),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.deferred.push_back(Event::Closed);
                    break;
                }
            }
        }
    }
}

/// A live `$state/set` addressed to this job, if `msg` is one.
fn state_request(identity: &JobIdentity, cluster: &ClusterView, msg: &Message) -> Option<JobState> {
    let path = TopicPath::parse(&msg.topic)?;
    if !path.set || path.attribute != STATE || path.job != identity.job || msg.retain {
        return None;
    }
    if !cluster.addressed_to(path.unit, path.experiment, &identity.experiment) {
        return None;
    }
    msg.payload_str().parse().ok()
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(t) => sleep_until(t).await,
        None => pending().await,
    }
}

enum Exit {
    Requested(String),
    ConnectionClosed,
}

struct Actor<J: Job> {
    job: J,
    ctx: JobContext,
    state_tx: watch::Sender<JobState>,
    registry: JobRegistry,
    schedule: Option<Schedule>,
    failures: FailurePolicy,
    dodger: Option<Dodger>,
}

impl<J: Job> Actor<J> {
    async fn init(&mut self) -> Result<()> {
        let mut filters: Vec<String> = self.ctx.identity.set_filters().into();
        filters.push(INVENTORY.to_string());
        filters.push(LATEST_EXPERIMENT.to_string());
        filters.extend(self.job.subscriptions(&self.ctx.identity));
        for f in &filters {
            self.ctx.transport.subscribe(f, Qos::AtLeastOnce).await?;
        }

        self.job.on_init(&mut self.ctx).await?;
        self.job.on_ready(&mut self.ctx).await?;

        let doc = self.ctx.settings.properties_document(&self.ctx.identity.job);
        self.ctx.publish(PROPERTIES, doc.to_string()).await?;
        self.flush().await;
        self.set_state(JobState::Ready).await?;
        self.start_schedule();
        if let Some(d) = self.dodger.as_mut() {
            d.refresh(&self.ctx).await;
        }
        info!(experiment = %self.ctx.identity.experiment, "ready");
        Ok(())
    }

    fn start_schedule(&mut self) {
        self.schedule = self.job.period().map(|p| Schedule::new(Instant::now(), p));
    }

    async fn set_state(&mut self, next: JobState) -> Result<()> {
        let from = self.ctx.state;
        if !from.can_transition_to(next) {
            return Err(JobError::IllegalTransition { from, to: next });
        }
        self.ctx.state = next;
        self.state_tx.send_replace(next);
        debug!(%from, to = %next, "state changed");
        self.record_state().await
    }

    async fn record_state(&mut self) -> Result<()> {
        let state = self.ctx.state;
        self.ctx.publish(STATE, state.as_str()).await?;
        if let Err(e) = self.registry.update_state(&self.ctx.identity, state).await {
            warn!("failed to record state {state}: {e}");
        }
        Ok(())
    }

    /// Announce the job again after the broker published its will.
    async fn rejoin(&mut self) {
        warn!(state = %self.ctx.state, "reconnected after being declared lost, announcing again");
        let doc = self.ctx.settings.properties_document(&self.ctx.identity.job);
        if let Err(e) = self.ctx.publish(PROPERTIES, doc.to_string()).await {
            warn!("failed to republish {PROPERTIES}: {e}");
        }
        for (name, payload) in self.ctx.settings.republish() {
            if let Err(e) = self.ctx.publish(name, payload).await {
                warn!(attribute = name, "republish failed: {e}");
            }
        }
        if let Err(e) = self.record_state().await {
            warn!("failed to republish state: {e}");
        }
    }

    async fn flush(&mut self) {
        for (name, payload) in self.ctx.settings.flush() {
            if let Err(e) = self.ctx.publish(name, payload).await {
                warn!(attribute = name, "publish failed: {e}");
            }
        }
    }

    async fn run(mut self) {
        let mut dodge_poll = tokio::time::interval(DODGE_POLL);
        dodge_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let dodging = self.dodger.is_some();

        let exit = loop {
            let ready = self.ctx.state == JobState::Ready;
            let tick_at = self
                .schedule
                .as_ref()
                .filter(|_| ready)
                .map(Schedule::next_deadline);
            let dodge_at = self.dodger.as_ref().and_then(Dodger::deadline);

            tokio::select! {
                ev = self.ctx.mailbox.next() => match ev {
                    Event::Command(cmd) => self.handle_command(cmd).await,
                    Event::Message(msg) => self.handle_message(msg).await,
                    Event::Reconnected => self.rejoin().await,
                    Event::Closed => break Exit::ConnectionClosed,
                },
                _ = sleep_opt(tick_at) => self.tick().await,
                _ = sleep_opt(dodge_at) => self.dodge_step().await,
                _ = dodge_poll.tick(), if dodging => {
                    if let Some(d) = self.dodger.as_mut() {
                        d.refresh(&self.ctx).await;
                    }
                }
            }

            self.flush().await;
            if let Some(reason) = self.ctx.stop.take() {
                break Exit::Requested(reason);
            }
        };
        self.shutdown(exit).await;
    }

    // -- Events ---------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetState(state, reply) => {
                let _ = reply.send(self.request_state(state).await);
            }
            Command::Set {
                name,
                payload,
                reply,
            } => {
                let _ = reply.send(self.apply_set(&name, &payload).await);
            }
            Command::Disconnect => self.ctx.request_disconnect("requested"),
        }
    }

    async fn handle_message(&mut self, msg: Message) {
        if self.ctx.cluster.apply(&msg) {
            return;
        }
        if let Some(path) = TopicPath::parse(&msg.topic) {
            if path.set && path.job == self.ctx.identity.job {
                if !self.ctx.cluster.addressed_to(
                    path.unit,
                    path.experiment,
                    &self.ctx.identity.experiment,
                ) {
                    return;
                }
                if msg.retain {
                    debug!(topic = %msg.topic, "ignoring retained set");
                    return;
                }
                let payload = msg.payload_str();
                let result = if path.attribute == STATE {
                    match payload.parse::<JobState>() {
                        Ok(s) => self.request_state(s).await,
                        Err(e) => Err(JobError::InvalidArgument(e)),
                    }
                } else {
                    self.apply_set(&path.attribute, &payload).await
                };
                if let Err(e) = result {
                    warn!(topic = %msg.topic, "{e}");
                }
                return;
            }
        }
        if let Err(e) = self.job.on_message(&mut self.ctx, &msg).await {
            self.report(e, "message handler failed");
        }
    }

    async fn apply_set(&mut self, name: &str, payload: &str) -> Result<()> {
        let value = self.ctx.settings.coerce(name, payload)?;
        self.job.on_set(&mut self.ctx, name, value).await
    }

    /// Pause, resume or stop on request. Asking for the current state is a
    /// no-op.
    async fn request_state(&mut self, next: JobState) -> Result<()> {
        let current = self.ctx.state;
        if next == current {
            return Ok(());
        }
        match next {
            JobState::Disconnected => {
                self.ctx.request_disconnect("requested");
                Ok(())
            }
            JobState::Sleeping if current == JobState::Ready => {
                self.set_state(JobState::Sleeping).await?;
                if let Some(d) = self.dodger.as_mut() {
                    d.enter(None);
                }
                let r = self.job.on_sleeping(&mut self.ctx).await;
                crate::notice!("paused");
                r
            }
            JobState::Ready if current == JobState::Sleeping => {
                self.job.on_ready(&mut self.ctx).await?;
                self.set_state(JobState::Ready).await?;
                self.start_schedule();
                if let Some(d) = self.dodger.as_mut() {
                    d.refresh(&self.ctx).await;
                }
                crate::notice!("resumed");
                Ok(())
            }
            _ => Err(JobError::IllegalTransition {
                from: current,
                to: next,
            }),
        }
    }

    async fn tick(&mut self) {
        let budget = self.job.tick_budget();
        let result = run_tick(budget, self.job.tick(&mut self.ctx)).await;
        if let Some(s) = self.schedule.as_mut() {
            let skipped = s.advance(Instant::now());
            if skipped > 0 {
                warn!(skipped, "tick overran its period");
            }
        }
        match result {
            Ok(()) => self.failures.record_success(),
            Err(e) if e.is_fatal() => {
                error!("{e}");
                self.ctx.request_disconnect(e.to_string());
            }
            Err(e) => {
                warn!(consecutive = self.failures.consecutive() + 1, "tick failed: {e}");
                if let Err(fatal) = self.failures.record_failure(&e) {
                    error!("{fatal}");
                    self.ctx.request_disconnect(fatal.to_string());
                }
            }
        }
    }

    async fn dodge_step(&mut self) {
        let Some(mut dodger) = self.dodger.take() else {
            return;
        };
        let ready = self.ctx.state == JobState::Ready;
        let now = now_unix_ms();
        match dodger.phase {
            Some(DodgePhase::Waiting(w)) if ready && now < w.after_ms => {
                if let Err(e) = self.job.before_dodge(&mut self.ctx).await {
                    self.report(e, "before_dodge failed");
                }
                dodger.enter(Some(DodgePhase::Dodging(w)));
            }
            Some(DodgePhase::Dodging(w)) => {
                if ready {
                    if let Err(e) = self.job.after_dodge(&mut self.ctx).await {
                        self.report(e, "after_dodge failed");
                    }
                }
                dodger.next_window(now.max(w.after_ms));
            }
            Some(DodgePhase::Waiting(w)) => dodger.next_window(now.max(w.after_ms)),
            None => {}
        }
        self.dodger = Some(dodger);
    }

    fn report(&mut self, e: JobError, what: &str) {
        if e.is_fatal() {
            error!("{what}: {e}");
            self.ctx.request_disconnect(e.to_string());
        } else {
            warn!("{what}: {e}");
        }
    }

    // -- Shutdown -------------------------------------------------------------

    async fn shutdown(mut self, exit: Exit) {
        let lost = matches!(exit, Exit::ConnectionClosed);
        match &exit {
            Exit::Requested(reason) => info!(reason = %reason, "disconnecting"),
            Exit::ConnectionClosed => warn!("connection closed under the job"),
        }

        while let Some(child) = self.ctx.children.pop() {
            if let Err(e) = child.disconnect().await {
                warn!(child = %child.identity.job, "child disconnect failed: {e}");
            }
        }

        if let Err(e) = self.job.on_disconnected(&mut self.ctx).await {
            warn!("on_disconnected failed: {e}");
        }

        // Handles see the terminal state only once everything is released.
        if lost {
            self.ctx.state = JobState::Lost;
        } else {
            if self.job.clear_on_disconnect() {
                for name in self.ctx.settings.clear_topics() {
                    if let Err(e) = self.ctx.transport.clear(&self.ctx.topic(name)).await {
                        warn!(attribute = name, "failed to clear: {e}");
                    }
                }
                if let Err(e) = self.ctx.transport.clear(&self.ctx.topic(PROPERTIES)).await {
                    warn!("failed to clear {PROPERTIES}: {e}");
                }
            }
            self.ctx.state = JobState::Disconnected;
            if let Err(e) = self.record_state().await {
                warn!("failed to publish disconnected state: {e}");
            }
            if let Err(e) = self.ctx.transport.disconnect().await {
                warn!("clean disconnect failed: {e}");
            }
        }

        if let Err(e) = self.registry.release(&self.ctx.identity).await {
            warn!("failed to release job claim: {e}");
        }
        self.state_tx.send_replace(self.ctx.state);
        crate::notice!("disconnected");
    }
}

// ---------------------------------------------------------------------------
// Dodging
// ---------------------------------------------------------------------------

struct Dodger {
    target: &'static str,
    schedule: Option<DodgeSchedule>,
    phase: Option<DodgePhase>,
    /// Deadline of the current phase, fixed when the phase is entered.
    due: Option<Instant>,
}

impl Dodger {
    fn new(target: &'static str) -> Self {
        Self {
            target,
            schedule: None,
            phase: None,
            due: None,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.due
    }

    fn enter(&mut self, phase: Option<DodgePhase>) {
        self.phase = phase;
        self.due = phase.map(|p| instant_at(p.due_ms()));
    }

    fn next_window(&mut self, from_ms: i64) {
        let next = self
            .schedule
            .and_then(|s| s.window_at(from_ms))
            .map(DodgePhase::Waiting);
        self.enter(next);
    }

    /// Pick up a new or removed schedule. An ongoing dodge is finished first.
    async fn refresh(&mut self, ctx: &JobContext) {
        let latest = match DodgeSchedule::load(&ctx.caches.intermittent, &ctx.identity.unit, self.target).await {
            Ok(s) => s,
            Err(e) => {
                warn!(target = self.target, "failed to read dodge schedule: {e}");
                return;
            }
        };
        if latest == self.schedule && self.phase.is_some() {
            return;
        }
        if latest != self.schedule {
            debug!(target = self.target, schedule = ?latest, "dodge schedule changed");
        }
        self.schedule = latest;
        if !matches!(self.phase, Some(DodgePhase::Dodging(_))) {
            self.next_window(now_unix_ms());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

/*!
 * Test automation.
 *
 * [`TestAutomation`] drives one test at a time through the [`TestState`]
 * machine. It owns the machine and is the only thing that transitions it:
 * operator commands, bus commands and its own timers all arrive on one
 * loop and are applied in order.
 *
 * Delays (initialization, auto start, return to idle) and the run clock are
 * spawned tasks that post a [`TimerEvent`] back to the loop. Each event
 * carries the machine's change count from when it was scheduled; an event
 * whose count no longer matches belongs to an earlier state and is dropped.
 */
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use pumpbench_core::config::AutomationConfig;
use pumpbench_core::event::{BusMessage, DynBus};
use pumpbench_core::record::RecordSink;
use pumpbench_core::topics::{CONTROL_TEST, TEST_STATUS};
use pumpbench_core::types::unix_timestamp;

use crate::control::{next_message, ControlService};
use crate::error::{Error, Result};
use crate::safety::SafetyGate;
use crate::sensors::SensorPoller;
use crate::state_machine::{AsyncStateHandler, StateHandler, StateMachine};
use crate::types::{TestConfig, TestContext, TestState};

const TICK: Duration = Duration::from_secs(1);
const COMMAND_QUEUE: usize = 32;

/// Machine driven by test automation
pub type TestMachine = StateMachine<TestState, TestContext>;

/// Operator command
#[derive(Debug, Clone, PartialEq)]
pub enum TestCommand {
    /// Start a test with the given parameters
    Start(TestConfig),
    /// Stop the running or paused test
    Stop,
    /// Pause the running test
    Pause,
    /// Resume the paused test
    Resume,
    /// Abandon everything and return to idle
    Reset,
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    action: String,
    #[serde(default)]
    config: Option<TestConfig>,
}

impl TestCommand {
    /// Parse a `{action, config?}` bus payload
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let body: CommandBody = serde_json::from_value(payload.clone())?;
        match body.action.to_lowercase().as_str() {
            "start" => Ok(TestCommand::Start(body.config.unwrap_or_default())),
            "stop" => Ok(TestCommand::Stop),
            "pause" => Ok(TestCommand::Pause),
            "resume" => Ok(TestCommand::Resume),
            "reset" => Ok(TestCommand::Reset),
            other => Err(Error::other(format!("Unknown test action: {}", other))),
        }
    }
}

/// What a timer fired for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Initialization delay is over
    InitDone,
    /// Auto start delay is over
    AutoStart,
    /// The run used up its duration
    RunElapsed,
    /// Time to leave a terminal state
    ReturnIdle,
}

/// A timer firing, tagged with the change count it was scheduled at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    /// Machine change count when scheduled
    pub changes: u64,
    /// What fired
    pub kind: TimerKind,
}

struct Request {
    command: TestCommand,
    reply: oneshot::Sender<Result<TestState>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").field("command", &self.command).finish()
    }
}

/// Cloneable handle for commanding a [`TestAutomation`] loop
#[derive(Debug, Clone)]
pub struct AutomationHandle {
    commands: mpsc::Sender<Request>,
    state: watch::Receiver<TestState>,
}

impl AutomationHandle {
    /// Send a command and wait for the state it left the machine in
    pub async fn send(&self, command: TestCommand) -> Result<TestState> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Request { command, reply })
            .await
            .map_err(|_| Error::other("Test automation is not running"))?;
        response
            .await
            .map_err(|_| Error::other("Test automation dropped the command"))?
    }

    /// Start a test
    pub async fn start_test(&self, config: TestConfig) -> Result<TestState> {
        self.send(TestCommand::Start(config)).await
    }

    /// Stop the current test
    pub async fn stop_test(&self) -> Result<TestState> {
        self.send(TestCommand::Stop).await
    }

    /// Pause the current test
    pub async fn pause_test(&self) -> Result<TestState> {
        self.send(TestCommand::Pause).await
    }

    /// Resume the paused test
    pub async fn resume_test(&self) -> Result<TestState> {
        self.send(TestCommand::Resume).await
    }

    /// Reset to idle
    pub async fn reset_test(&self) -> Result<TestState> {
        self.send(TestCommand::Reset).await
    }

    /// Current test state
    pub fn state(&self) -> TestState {
        *self.state.borrow()
    }

    /// Watch the test state
    pub fn subscribe(&self) -> watch::Receiver<TestState> {
        self.state.clone()
    }
}

#[derive(Debug, Default)]
struct RunState {
    config: TestConfig,
    test_id: Option<String>,
    duration: i64,
    accumulated: Duration,
    segment_start: Option<Instant>,
    start_time: Option<f64>,
    ticker: Option<CancellationToken>,
}

impl RunState {
    fn elapsed(&self) -> Duration {
        self.accumulated + self.segment_start.map_or(Duration::ZERO, |start| start.elapsed())
    }

    fn remaining(&self) -> Option<Duration> {
        u64::try_from(self.duration)
            .ok()
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs).saturating_sub(self.elapsed()))
    }
}

struct Runtime {
    bus: DynBus,
    sink: Arc<dyn RecordSink>,
    control: Arc<ControlService>,
    sensors: Option<Arc<SensorPoller>>,
    config: AutomationConfig,
    timers: mpsc::UnboundedSender<TimerEvent>,
    run: Mutex<RunState>,
}

impl Runtime {
    fn publish_status(&self, payload: Value) {
        if let Err(e) = self.bus.publish(TEST_STATUS, payload) {
            debug!("Failed to publish test status: {}", e);
        }
    }

    fn schedule(&self, kind: TimerKind, delay_ms: u64, changes: u64) {
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = timers.send(TimerEvent { changes, kind });
        });
    }

    fn test_id(&self) -> Option<String> {
        self.run.lock().test_id.clone()
    }

    fn check_readiness(&self) {
        if let Some(sensors) = &self.sensors {
            let missing = sensors.missing_devices();
            if missing.is_empty() {
                info!("All sensors connected");
            } else {
                warn!(?missing, "Initializing without some sensors");
            }
        }
        if !self.control.is_ready() {
            warn!("Control relay is not connected, initializing anyway");
        }
    }

    fn prepare(&self, context: Option<TestContext>) -> Result<String> {
        self.check_readiness();
        let config = match context {
            Some(TestContext::Config(config)) => config,
            _ => TestConfig::default(),
        };
        let test_id = config.resolve_test_id();
        let duration = config.duration_or(self.config.default_duration_s);
        *self.run.lock() = RunState {
            config,
            test_id: Some(test_id.clone()),
            duration,
            ..RunState::default()
        };
        self.sink.start_session(&test_id)?;
        info!(test_id, duration, "Test prepared");
        Ok(test_id)
    }

    fn start_clock(self: &Arc<Self>, changes: u64) {
        let token = CancellationToken::new();
        {
            let mut run = self.run.lock();
            run.segment_start = Some(Instant::now());
            run.start_time.get_or_insert_with(unix_timestamp);
            if let Some(previous) = run.ticker.replace(token.clone()) {
                previous.cancel();
            }
        }
        tokio::spawn(run_clock(self.clone(), token, changes));
    }

    /// Fold the running segment into the total and stop the clock task
    fn stop_clock(&self) -> Duration {
        let mut run = self.run.lock();
        if let Some(start) = run.segment_start.take() {
            run.accumulated += start.elapsed();
        }
        if let Some(ticker) = run.ticker.take() {
            ticker.cancel();
        }
        run.accumulated
    }

    fn stop_session(&self) {
        if let Some(test_id) = self.sink.active_session() {
            match self.sink.stop_session() {
                Ok(()) => info!(test_id, "Test recording stopped"),
                Err(e) => error!(test_id, "Failed to stop test recording: {}", e),
            }
        }
    }

    fn end_run(&self) {
        self.stop_clock();
        self.stop_session();
        *self.run.lock() = RunState::default();
    }
}

async fn run_clock(runtime: Arc<Runtime>, token: CancellationToken, changes: u64) {
    let interval = runtime.config.progress_interval_s;
    let mut last_mark = match interval {
        0 => 0,
        n => runtime.run.lock().elapsed().as_secs() / n,
    };
    loop {
        let remaining = runtime.run.lock().remaining();
        if remaining == Some(Duration::ZERO) {
            let _ = runtime.timers.send(TimerEvent {
                changes,
                kind: TimerKind::RunElapsed,
            });
            return;
        }
        let step = remaining.map_or(TICK, |remaining| remaining.min(TICK));
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(step) => {}
        }

        if interval == 0 {
            continue;
        }
        let (elapsed, remaining) = {
            let run = runtime.run.lock();
            (run.elapsed(), run.remaining())
        };
        let mark = elapsed.as_secs() / interval;
        if mark > last_mark {
            last_mark = mark;
            trace!(elapsed = elapsed.as_secs(), "Test progress");
            runtime.publish_status(json!({
                "status": "running",
                "elapsed": elapsed.as_secs_f64(),
                "remaining": remaining.map(|r| r.as_secs_f64()),
            }));
        }
    }
}

struct Initializing(Arc<Runtime>);

#[async_trait]
impl AsyncStateHandler<TestState, TestContext> for Initializing {
    async fn on_enter(&self, machine: &mut TestMachine, context: Option<TestContext>) -> anyhow::Result<()> {
        info!("Initializing test");
        match self.0.prepare(context) {
            Ok(_) => {
                self.0.schedule(TimerKind::InitDone, self.0.config.init_delay_ms, machine.changes());
            }
            Err(e) => {
                error!("Test initialization failed: {}", e);
                machine
                    .transition_to(TestState::Failed, Some(TestContext::error(e.to_string())))
                    .await;
            }
        }
        Ok(())
    }
}

struct Stopped(Arc<Runtime>);

#[async_trait]
impl AsyncStateHandler<TestState, TestContext> for Stopped {
    async fn on_enter(&self, machine: &mut TestMachine, _context: Option<TestContext>) -> anyhow::Result<()> {
        let runtime = &self.0;
        runtime.stop_clock();
        if let Err(e) = runtime.control.emergency_shutdown().await {
            error!("Emergency shutdown after stop was incomplete: {}", e);
        }
        runtime.stop_session();
        runtime.publish_status(json!({"status": "stopped"}));
        info!(test_id = ?runtime.test_id(), "Test stopped");
        runtime.schedule(TimerKind::ReturnIdle, runtime.config.stopped_delay_ms, machine.changes());
        Ok(())
    }
}

fn ready_handler(runtime: Arc<Runtime>) -> StateHandler<TestState, TestContext> {
    StateHandler::sync(move |machine, _| {
        let (test_id, auto_start) = {
            let run = runtime.run.lock();
            (run.test_id.clone(), run.config.auto_start)
        };
        info!(?test_id, auto_start, "Test ready");
        runtime.publish_status(json!({"status": "ready", "test_id": test_id}));
        if auto_start {
            runtime.schedule(TimerKind::AutoStart, runtime.config.ready_delay_ms, machine.changes());
        }
        Ok(())
    })
}

fn running_handler(runtime: Arc<Runtime>) -> StateHandler<TestState, TestContext> {
    StateHandler::sync(move |machine, _| {
        runtime.start_clock(machine.changes());
        let run = runtime.run.lock();
        let config = &run.config;
        if config.power_on == Some(true) {
            info!(power_type = ?config.power_type, "Test requests supply on");
        }
        if let Some(valves) = &config.valve_state {
            info!(?valves, "Test requests valve positions");
        }
        if run.duration > 0 {
            info!(test_id = ?run.test_id, duration = run.duration, "Test running");
        } else {
            info!(test_id = ?run.test_id, "Test running until stopped");
        }
        runtime.publish_status(json!({
            "status": "running",
            "test_id": run.test_id,
            "start_time": run.start_time,
            "duration": run.duration,
        }));
        Ok(())
    })
}

fn paused_handler(runtime: Arc<Runtime>) -> StateHandler<TestState, TestContext> {
    StateHandler::sync(move |_, _| {
        let elapsed = runtime.stop_clock();
        info!(elapsed_s = elapsed.as_secs_f64(), "Test paused");
        runtime.publish_status(json!({"status": "paused", "elapsed": elapsed.as_secs_f64()}));
        Ok(())
    })
}

fn completed_handler(runtime: Arc<Runtime>) -> StateHandler<TestState, TestContext> {
    StateHandler::sync(move |machine, _| {
        let elapsed = runtime.stop_clock();
        runtime.stop_session();
        info!(test_id = ?runtime.test_id(), elapsed_s = elapsed.as_secs_f64(), "Test completed");
        runtime.publish_status(json!({"status": "completed", "duration": elapsed.as_secs_f64()}));
        runtime.schedule(TimerKind::ReturnIdle, runtime.config.completed_delay_ms, machine.changes());
        Ok(())
    })
}

fn failed_handler(runtime: Arc<Runtime>) -> StateHandler<TestState, TestContext> {
    StateHandler::sync(move |_, context| {
        runtime.stop_clock();
        runtime.stop_session();
        let message = match context {
            Some(TestContext::Error { message }) => Some(message.clone()),
            _ => None,
        };
        error!(test_id = ?runtime.test_id(), error = ?message, "Test failed");
        runtime.publish_status(json!({"status": "failed", "error": message}));
        Ok(())
    })
}

/// Test sequencing over the test state machine
pub struct TestAutomation {
    machine: TestMachine,
    runtime: Arc<Runtime>,
    safety: Arc<dyn SafetyGate>,
    handle: AutomationHandle,
    commands: mpsc::Receiver<Request>,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
}

impl std::fmt::Debug for TestAutomation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestAutomation").field("machine", &self.machine).finish_non_exhaustive()
    }
}

impl TestAutomation {
    /// Automation publishing on `bus` and recording into `sink`
    ///
    /// `sensors` is only consulted for readiness warnings.
    pub fn new(
        bus: DynBus,
        sink: Arc<dyn RecordSink>,
        safety: Arc<dyn SafetyGate>,
        control: Arc<ControlService>,
        sensors: Option<Arc<SensorPoller>>,
        config: AutomationConfig,
    ) -> Self {
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let runtime = Arc::new(Runtime {
            bus,
            sink,
            control,
            sensors,
            config,
            timers: timer_tx,
            run: Mutex::new(RunState::default()),
        });

        let mut machine = TestMachine::new("test");
        machine.register_handler(
            TestState::Initializing,
            StateHandler::async_handler(Initializing(runtime.clone())),
        );
        machine.register_handler(TestState::Ready, ready_handler(runtime.clone()));
        machine.register_handler(TestState::Running, running_handler(runtime.clone()));
        machine.register_handler(TestState::Paused, paused_handler(runtime.clone()));
        machine.register_handler(TestState::Completed, completed_handler(runtime.clone()));
        machine.register_handler(TestState::Failed, failed_handler(runtime.clone()));
        machine.register_handler(TestState::Stopped, StateHandler::async_handler(Stopped(runtime.clone())));

        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let handle = AutomationHandle {
            commands: command_tx,
            state: machine.subscribe(),
        };

        Self {
            machine,
            runtime,
            safety,
            handle,
            commands,
            timers,
        }
    }

    /// Handle for sending commands to the running loop
    pub fn handle(&self) -> AutomationHandle {
        self.handle.clone()
    }

    /// Current test state
    pub fn state(&self) -> TestState {
        self.machine.current()
    }

    /// The underlying machine
    pub fn machine(&self) -> &TestMachine {
        &self.machine
    }

    /// Start a test from idle or ready
    pub async fn start_test(&mut self, config: TestConfig) -> Result<TestState> {
        let current = self.machine.current();
        if !matches!(current, TestState::Idle | TestState::Ready) {
            return Err(self.reject(Error::invalid_state(format!("Cannot start a test while {}", current))));
        }
        if let Err(e) = self.safety.check_start_conditions() {
            return Err(self.reject(e));
        }
        if current == TestState::Ready {
            debug!("Discarding prepared test before starting a new one");
            self.runtime.end_run();
            self.machine.reset();
        }
        self.machine
            .transition_to(TestState::Initializing, Some(TestContext::Config(config)))
            .await;
        Ok(self.machine.current())
    }

    /// Stop a running or paused test
    pub async fn stop_test(&mut self) -> Result<TestState> {
        self.require(&[TestState::Running, TestState::Paused], "stop")?;
        self.machine
            .transition_to(TestState::Stopped, Some(TestContext::reason("stop requested")))
            .await;
        Ok(self.machine.current())
    }

    /// Pause a running test
    pub async fn pause_test(&mut self) -> Result<TestState> {
        self.require(&[TestState::Running], "pause")?;
        self.machine
            .transition_to(TestState::Paused, Some(TestContext::reason("pause requested")))
            .await;
        Ok(self.machine.current())
    }

    /// Resume a paused test with its remaining duration
    pub async fn resume_test(&mut self) -> Result<TestState> {
        self.require(&[TestState::Paused], "resume")?;
        self.machine
            .transition_to(TestState::Running, Some(TestContext::reason("resume requested")))
            .await;
        Ok(self.machine.current())
    }

    /// Drop the current test, if any, and return to idle
    pub fn reset_test(&mut self) -> Result<TestState> {
        self.runtime.end_run();
        self.machine.reset();
        info!("Test reset");
        Ok(self.machine.current())
    }

    /// Apply one command
    pub async fn execute(&mut self, command: TestCommand) -> Result<TestState> {
        match command {
            TestCommand::Start(config) => self.start_test(config).await,
            TestCommand::Stop => self.stop_test().await,
            TestCommand::Pause => self.pause_test().await,
            TestCommand::Resume => self.resume_test().await,
            TestCommand::Reset => self.reset_test(),
        }
    }

    /// Apply a timer event unless it is stale
    pub async fn process_timer(&mut self, event: TimerEvent) {
        if event.changes != self.machine.changes() {
            trace!(?event, changes = self.machine.changes(), "Stale timer ignored");
            return;
        }
        let (to, reason) = match event.kind {
            TimerKind::InitDone => (TestState::Ready, "initialized"),
            TimerKind::AutoStart => (TestState::Running, "auto start"),
            TimerKind::RunElapsed => (TestState::Completed, "duration reached"),
            TimerKind::ReturnIdle => (TestState::Idle, "finished"),
        };
        self.machine.transition_to(to, Some(TestContext::reason(reason))).await;
    }

    /// Serve commands and timers until cancelled
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let mut bus_commands = self.runtime.bus.subscribe(CONTROL_TEST)?;
        info!("Test automation started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(request) = self.commands.recv() => {
                    let result = self.execute(request.command).await;
                    let _ = request.reply.send(result);
                }
                Some(event) = self.timers.recv() => self.process_timer(event).await,
                message = next_message(&mut bus_commands, CONTROL_TEST) => match message {
                    Some(message) => self.on_bus_command(&message).await,
                    None => break,
                },
            }
        }

        self.runtime.end_run();
        info!("Test automation stopped");
        Ok(())
    }

    async fn on_bus_command(&mut self, message: &BusMessage) {
        match TestCommand::from_payload(&message.payload) {
            Ok(command) => {
                debug!(?command, "Test command from bus");
                // rejections are already published
                let _ = self.execute(command).await;
            }
            Err(e) => {
                let _ = self.reject(e);
            }
        }
    }

    fn require(&self, allowed: &[TestState], action: &str) -> Result<()> {
        let current = self.machine.current();
        if allowed.contains(&current) {
            return Ok(());
        }
        Err(self.reject(Error::invalid_state(format!("Cannot {} a test while {}", action, current))))
    }

    fn reject(&self, error: Error) -> Error {
        warn!(state = %self.machine.current(), "Test command rejected: {}", error);
        self.runtime.publish_status(json!({
            "status": "error",
            "message": error.to_string(),
            "state": self.machine.current(),
        }));
        error
    }
}

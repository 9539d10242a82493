/*!
 * Finite state machine with a fixed transition table.
 *
 * The machine is generic over its state type, which supplies the table
 * through [`MachineState`], and over the context passed along with each
 * transition. One handler may be registered per state; it runs after the
 * machine has entered that state. Handlers are either plain functions or
 * async handlers that get the machine itself and may transition further.
 */
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A state type with a fixed transition table
pub trait MachineState: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// State a new or reset machine is in
    fn initial() -> Self;

    /// States reachable from this one
    fn successors(self) -> &'static [Self];

    /// Whether `to` is reachable from this state
    fn can_reach(self, to: Self) -> bool {
        self.successors().contains(&to)
    }
}

/// One committed transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord<S, C> {
    /// State left
    pub from: S,
    /// State entered
    pub to: S,
    /// Context the transition was requested with
    pub context: Option<C>,
    /// When the transition was committed
    pub timestamp: DateTime<Utc>,
}

/// Handler run after a state is entered, allowed to transition further
#[async_trait]
pub trait AsyncStateHandler<S: MachineState, C: Clone + Send + Sync + 'static>: Send + Sync {
    /// Called with the machine already in the new state
    async fn on_enter(&self, machine: &mut StateMachine<S, C>, context: Option<C>) -> anyhow::Result<()>;
}

type SyncFn<S, C> = dyn Fn(&StateMachine<S, C>, Option<&C>) -> anyhow::Result<()> + Send + Sync;

/// Handler registered for one state
pub enum StateHandler<S: MachineState, C: Clone + Send + Sync + 'static> {
    /// Runs inline and cannot transition
    Sync(Arc<SyncFn<S, C>>),
    /// Awaited, with mutable access to the machine
    Async(Arc<dyn AsyncStateHandler<S, C>>),
}

impl<S: MachineState, C: Clone + Send + Sync + 'static> StateHandler<S, C> {
    /// Wrap a plain function
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&StateMachine<S, C>, Option<&C>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        StateHandler::Sync(Arc::new(f))
    }

    /// Wrap an async handler
    pub fn async_handler<H: AsyncStateHandler<S, C> + 'static>(handler: H) -> Self {
        StateHandler::Async(Arc::new(handler))
    }
}

impl<S: MachineState, C: Clone + Send + Sync + 'static> Clone for StateHandler<S, C> {
    fn clone(&self) -> Self {
        match self {
            StateHandler::Sync(f) => StateHandler::Sync(f.clone()),
            StateHandler::Async(h) => StateHandler::Async(h.clone()),
        }
    }
}

impl<S: MachineState, C: Clone + Send + Sync + 'static> fmt::Debug for StateHandler<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateHandler::Sync(_) => f.write_str("StateHandler::Sync"),
            StateHandler::Async(_) => f.write_str("StateHandler::Async"),
        }
    }
}

/// State machine over the table of `S`
pub struct StateMachine<S: MachineState, C: Clone + Send + Sync + 'static> {
    name: String,
    current: S,
    previous: Option<S>,
    history: Vec<TransitionRecord<S, C>>,
    handlers: HashMap<S, StateHandler<S, C>>,
    changes: u64,
    observers: watch::Sender<S>,
}

impl<S: MachineState, C: Clone + Send + Sync + 'static> fmt::Debug for StateMachine<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("current", &self.current)
            .field("previous", &self.previous)
            .field("history", &self.history.len())
            .finish()
    }
}

impl<S: MachineState, C: Clone + Send + Sync + 'static> StateMachine<S, C> {
    /// Create a machine in the initial state
    pub fn new<N: Into<String>>(name: N) -> Self {
        let (observers, _) = watch::channel(S::initial());
        Self {
            name: name.into(),
            current: S::initial(),
            previous: None,
            history: Vec::new(),
            handlers: HashMap::new(),
            changes: 0,
            observers,
        }
    }

    /// Name of the machine
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn current(&self) -> S {
        self.current
    }

    /// State before the last transition; cleared by [`StateMachine::reset`]
    pub fn previous(&self) -> Option<S> {
        self.previous
    }

    /// Every committed transition, oldest first
    pub fn history(&self) -> &[TransitionRecord<S, C>] {
        &self.history
    }

    /// Number of state changes so far, resets included
    ///
    /// Work scheduled in one state can compare this value to find out
    /// whether the machine has moved on since.
    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// Whether the table allows moving to `to` from the current state
    pub fn can_transition_to(&self, to: S) -> bool {
        self.current.can_reach(to)
    }

    /// Watch the current state
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.observers.subscribe()
    }

    /// Register the handler for `state`, replacing any earlier one
    pub fn register_handler(&mut self, state: S, handler: StateHandler<S, C>) {
        if self.handlers.insert(state, handler).is_some() {
            debug!(machine = %self.name, %state, "Replaced state handler");
        }
    }

    /// Move to `to` if the table allows it, then run its handler
    ///
    /// Moving to the current state does nothing. A move the table does not
    /// allow is logged and ignored. A failing handler is logged; the
    /// transition stays committed. Returns whether the state changed.
    pub async fn transition_to(&mut self, to: S, context: Option<C>) -> bool {
        let from = self.current;
        if to == from {
            return false;
        }
        if !from.can_reach(to) {
            warn!(machine = %self.name, %from, %to, "Illegal transition ignored");
            return false;
        }

        self.previous = Some(from);
        self.set_current(to);
        self.history.push(TransitionRecord {
            from,
            to,
            context: context.clone(),
            timestamp: Utc::now(),
        });
        info!(machine = %self.name, %from, %to, "State changed");

        let handler = self.handlers.get(&to).cloned();
        let result = match handler {
            Some(StateHandler::Sync(f)) => f(self, context.as_ref()),
            Some(StateHandler::Async(h)) => h.on_enter(self, context).await,
            None => Ok(()),
        };
        if let Err(e) = result {
            error!(machine = %self.name, state = %to, "State handler failed: {:#}", e);
        }
        true
    }

    /// Return to the initial state without running handlers
    ///
    /// The history is kept.
    pub fn reset(&mut self) {
        let from = self.current;
        self.previous = None;
        self.set_current(S::initial());
        info!(machine = %self.name, %from, "State machine reset");
    }

    fn set_current(&mut self, state: S) {
        self.current = state;
        self.changes += 1;
        self.observers.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Door {
        Closed,
        Open,
        Locked,
    }

    impl fmt::Display for Door {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl MachineState for Door {
        fn initial() -> Self {
            Door::Closed
        }

        fn successors(self) -> &'static [Self] {
            match self {
                Door::Closed => &[Door::Open, Door::Locked],
                Door::Open => &[Door::Closed],
                Door::Locked => &[Door::Closed],
            }
        }
    }

    type Machine = StateMachine<Door, String>;

    #[tokio::test]
    async fn test_legal_transition_is_recorded() {
        let mut machine = Machine::new("door");
        assert!(machine.transition_to(Door::Open, Some("push".to_string())).await);

        assert_eq!(machine.current(), Door::Open);
        assert_eq!(machine.previous(), Some(Door::Closed));
        assert_eq!(machine.history().len(), 1);
        assert_eq!(machine.history()[0].context.as_deref(), Some("push"));
    }

    #[tokio::test]
    async fn test_illegal_and_same_state_transitions_are_ignored() {
        let mut machine = Machine::new("door");
        machine.transition_to(Door::Open, None).await;

        assert!(!machine.transition_to(Door::Locked, None).await);
        assert!(!machine.transition_to(Door::Open, None).await);
        assert_eq!(machine.current(), Door::Open);
        assert_eq!(machine.history().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_handler_runs_after_commit() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut machine = Machine::new("door");
        let counter = seen.clone();
        machine.register_handler(
            Door::Open,
            StateHandler::sync(move |machine, context| {
                assert_eq!(machine.current(), Door::Open);
                assert_eq!(context.map(String::as_str), Some("push"));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        machine.transition_to(Door::Open, Some("push".to_string())).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    struct SlamShut;

    #[async_trait]
    impl AsyncStateHandler<Door, String> for SlamShut {
        async fn on_enter(&self, machine: &mut Machine, _context: Option<String>) -> anyhow::Result<()> {
            machine.transition_to(Door::Closed, Some("wind".to_string())).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_async_handler_can_transition() {
        let mut machine = Machine::new("door");
        machine.register_handler(Door::Open, StateHandler::async_handler(SlamShut));

        machine.transition_to(Door::Open, None).await;
        assert_eq!(machine.current(), Door::Closed);
        assert_eq!(machine.history().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_handler_keeps_transition() {
        let mut machine = Machine::new("door");
        machine.register_handler(Door::Locked, StateHandler::sync(|_, _| anyhow::bail!("jammed")));

        assert!(machine.transition_to(Door::Locked, None).await);
        assert_eq!(machine.current(), Door::Locked);
    }

    #[tokio::test]
    async fn test_reregistering_replaces_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut machine = Machine::new("door");
        machine.register_handler(Door::Open, StateHandler::sync(|_, _| anyhow::bail!("old")));
        let counter = calls.clone();
        machine.register_handler(
            Door::Open,
            StateHandler::sync(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        machine.transition_to(Door::Open, None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_keeps_history_and_notifies() {
        let mut machine = Machine::new("door");
        let mut observer = machine.subscribe();
        machine.transition_to(Door::Locked, None).await;
        assert_eq!(*observer.borrow_and_update(), Door::Locked);

        machine.reset();
        assert_eq!(machine.current(), Door::Closed);
        assert_eq!(machine.previous(), None);
        assert_eq!(machine.history().len(), 1);
        assert_eq!(machine.changes(), 2);
        assert!(observer.has_changed().unwrap());
        assert!(machine.can_transition_to(Door::Open));
    }
}

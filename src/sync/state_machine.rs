//! Declarative state machine
//!
//! Holds the current state behind a mutex and applies a pure resolver
//! `(state, action) -> state`. Every new state is pushed onto an unbounded
//! channel so the owning component can respond to each one in order,
//! including short-lived intermediate states.

use std::fmt::Debug;
use std::mem;
use std::sync::Mutex as StdMutex;

use tokio::sync::mpsc;

pub type Resolver<S, A> = fn(&S, &A) -> S;

pub struct StateMachine<S, A> {
    state: StdMutex<S>,
    resolver: Resolver<S, A>,
    sender: mpsc::UnboundedSender<S>,
}

impl<S, A> StateMachine<S, A>
where
    S: Clone + Debug + Send + 'static,
    A: Debug,
{
    /// Returns the machine and the receiving end of its state stream.
    pub fn new(initial: S, resolver: Resolver<S, A>) -> (Self, mpsc::UnboundedReceiver<S>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let machine = Self {
            state: StdMutex::new(initial),
            resolver,
            sender,
        };
        (machine, receiver)
    }

    pub fn state(&self) -> S {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply an action. A resolver result of the same variant as the current
    /// state counts as "no transition" and is not published.
    pub fn notify(&self, action: A) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let next = (self.resolver)(&current, &action);

        if mem::discriminant(&next) == mem::discriminant(&*current) {
            return;
        }

        log::trace!("{:?} + {:?} -> {:?}", *current, action, next);
        *current = next.clone();

        // Send while holding the lock so the stream order matches transition order
        if self.sender.send(next).is_err() {
            log::debug!("State listener dropped; transition not delivered");
        }
    }
}

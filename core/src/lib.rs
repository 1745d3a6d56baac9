//! # SkyMarket Core
//!
//! The functional-core abstractions the booking lifecycle is written against.
//!
//! - **State**: the aggregate a reducer owns (one booking, one dispute)
//! - **Action**: commands (requests to change state) and events (facts)
//! - **Reducer**: pure function `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: description of a side effect, executed by the caller
//! - **Environment**: injected dependencies (clock, notifier, pricing tables)
//!
//! Reducers never perform I/O. Anything observable outside the aggregate (a
//! notification, a provider call) is returned as an [`effect::Effect`] and run
//! by the imperative shell after the new state has been persisted.
//!
//! ## Example
//!
//! ```ignore
//! impl Reducer for BookingReducer {
//!     type State = BookingState;
//!     type Action = BookingAction;
//!     type Environment = BookingEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut BookingState,
//!         action: BookingAction,
//!         env: &BookingEnvironment,
//!     ) -> SmallVec<[Effect<BookingAction>; 4]> {
//!         // validate, apply events, describe effects
//!         SmallVec::new()
//!     }
//! }
//! ```

pub use smallvec::{SmallVec, smallvec};

/// The reducer trait: all business rules of an aggregate live behind it.
pub mod reducer {
    use super::SmallVec;
    use super::effect::Effect;

    /// Core abstraction for business logic.
    ///
    /// # Type Parameters
    ///
    /// - `State`: the aggregate this reducer operates on
    /// - `Action`: the commands and events it processes
    /// - `Environment`: the injected dependencies it reads
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects.
        ///
        /// 1. Validates the action against the current state
        /// 2. Applies the resulting events in place
        /// 3. Returns effect descriptions for the caller to execute
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Side effect descriptions.
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;

    /// Describes a side effect to be executed after a reduction.
    ///
    /// Effects are values. The reducer returns them; the shell decides when to
    /// run them (after the state they describe has been committed).
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects concurrently
        Parallel(Vec<Effect<Action>>),

        /// Run effects one after another
        Sequential(Vec<Effect<Action>>),

        /// Arbitrary async computation.
        ///
        /// Resolves to `Some(action)` when the outcome should be fed back.
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run concurrently
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Wrap a future that produces no feedback action.
        pub fn fire_and_forget<F>(fut: F) -> Effect<Action>
        where
            F: Future<Output = ()> + Send + 'static,
        {
            Effect::Future(Box::pin(async move {
                fut.await;
                None
            }))
        }

        /// Returns `true` for `Effect::None` and for empty compositions.
        #[must_use]
        pub fn is_none(&self) -> bool {
            match self {
                Effect::None => true,
                Effect::Parallel(effects) | Effect::Sequential(effects) => {
                    effects.iter().all(Effect::is_none)
                },
                Effect::Future(_) => false,
            }
        }

        /// Run this effect to completion, collecting any feedback actions.
        ///
        /// `Parallel` children are polled concurrently; `Sequential` children run
        /// in order.
        pub fn run(self) -> Pin<Box<dyn Future<Output = Vec<Action>> + Send>>
        where
            Action: Send + 'static,
        {
            Box::pin(async move {
                match self {
                    Effect::None => Vec::new(),
                    Effect::Future(fut) => fut.await.into_iter().collect(),
                    Effect::Parallel(effects) => {
                        futures::future::join_all(effects.into_iter().map(Effect::run))
                            .await
                            .into_iter()
                            .flatten()
                            .collect()
                    },
                    Effect::Sequential(effects) => {
                        let mut actions = Vec::new();
                        for effect in effects {
                            actions.extend(effect.run().await);
                        }
                        actions
                    },
                }
            })
        }
    }
}

/// Dependency injection traits shared across aggregates.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Abstracts time so lifecycle timestamps and windows are testable.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

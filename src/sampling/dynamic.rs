//! Thread-safe configuration cells for values that can change at runtime
//!
//! Remote configuration can update a handful of tracer settings after
//! startup. Each such setting lives in a `DynamicConfig` cell that
//! remembers its startup value, tracks where the current value came
//! from, and invokes an apply callback on every effective change.

use parking_lot::RwLock;

/// Where the current value of a cell originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Default,
    EnvVar,
    RemoteConfig,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Default => "default",
            Origin::EnvVar => "env_var",
            Origin::RemoteConfig => "remote_config",
        }
    }
}

struct CellState<T> {
    current: T,
    startup: T,
    origin: Origin,
}

/// A single runtime-updatable configuration value.
///
/// Writers take the exclusive lock, readers the shared one. The apply
/// callback runs outside the lock with the new value.
pub struct DynamicConfig<T: Clone + PartialEq> {
    state: RwLock<CellState<T>>,
    apply: Option<Box<dyn Fn(&T) + Send + Sync>>,
}

impl<T: Clone + PartialEq> DynamicConfig<T> {
    pub fn new(startup: T, origin: Origin) -> DynamicConfig<T> {
        DynamicConfig {
            state: RwLock::new(CellState {
                current: startup.clone(),
                startup,
                origin,
            }),
            apply: None,
        }
    }

    pub fn with_apply<F>(startup: T, origin: Origin, apply: F) -> DynamicConfig<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        DynamicConfig {
            state: RwLock::new(CellState {
                current: startup.clone(),
                startup,
                origin,
            }),
            apply: Some(Box::new(apply)),
        }
    }

    pub fn get(&self) -> T {
        self.state.read().current.clone()
    }

    pub fn origin(&self) -> Origin {
        self.state.read().origin
    }

    /// Install a new value. Returns true when the stored value changed.
    pub fn update(&self, value: T, origin: Origin) -> bool {
        let changed = {
            let mut state = self.state.write();
            if state.current == value && state.origin == origin {
                false
            } else {
                state.current = value.clone();
                state.origin = origin;
                true
            }
        };
        if changed {
            if let Some(apply) = &self.apply {
                apply(&value);
            }
        }
        changed
    }

    /// Revert to the startup value.
    pub fn reset(&self) -> bool {
        let (changed, value) = {
            let mut state = self.state.write();
            if state.current == state.startup && state.origin != Origin::RemoteConfig {
                (false, None)
            } else {
                state.current = state.startup.clone();
                state.origin = Origin::Default;
                (true, Some(state.current.clone()))
            }
        };
        if changed {
            if let (Some(apply), Some(value)) = (&self.apply, value) {
                apply(&value);
            }
        }
        changed
    }

    /// Apply a remote-config payload: a present value updates, an absent
    /// field reverts the cell to its startup value.
    pub fn handle_rc(&self, value: Option<T>) -> bool {
        match value {
            Some(v) => self.update(v, Origin::RemoteConfig),
            None => self.reset(),
        }
    }
}

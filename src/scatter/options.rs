//! Configuration knobs for scatter plans.
//!
//! Options can be set explicitly, parsed from JSON, or read from the process
//! environment:
//!
//! | variable | field |
//! |---|---|
//! | `VECSCATTER_MERGE` | `merged` |
//! | `VECSCATTER_VIEW` | `view_on_create` |
//! | `VECSCATTER_CHECK_INDICES` | `check_indices` |

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::scatter_error::ScatterError;

pub const ENV_MERGE: &str = "VECSCATTER_MERGE";
pub const ENV_VIEW: &str = "VECSCATTER_VIEW";
pub const ENV_CHECK_INDICES: &str = "VECSCATTER_CHECK_INDICES";

/// Per-plan configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScatterOptions {
    /// Run `end` inside `begin`; a later `end` is a no-op.
    pub merged: bool,
    /// Log the plan view at `debug` level once it is built.
    pub view_on_create: bool,
    /// Validate the stored slots after creation and after every remap.
    pub check_indices: bool,
}

impl Default for ScatterOptions {
    fn default() -> Self {
        Self {
            merged: false,
            view_on_create: false,
            check_indices: cfg!(debug_assertions),
        }
    }
}

impl ScatterOptions {
    /// Defaults overridden by any `VECSCATTER_*` variables that are set.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        read_flag(ENV_MERGE, &mut opts.merged);
        read_flag(ENV_VIEW, &mut opts.view_on_create);
        read_flag(ENV_CHECK_INDICES, &mut opts.check_indices);
        opts
    }

    pub fn from_json(text: &str) -> Result<Self, ScatterError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Options used when a plan is created without explicit ones. Read from
    /// the environment once per process.
    pub fn process_default() -> &'static ScatterOptions {
        static DEFAULT: OnceCell<ScatterOptions> = OnceCell::new();
        DEFAULT.get_or_init(ScatterOptions::from_env)
    }

    pub fn merged(mut self, on: bool) -> Self {
        self.merged = on;
        self
    }

    pub fn view_on_create(mut self, on: bool) -> Self {
        self.view_on_create = on;
        self
    }

    pub fn check_indices(mut self, on: bool) -> Self {
        self.check_indices = on;
        self
    }
}

fn read_flag(var: &str, slot: &mut bool) {
    let Ok(raw) = std::env::var(var) else {
        return;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *slot = true,
        "0" | "false" | "no" | "off" => *slot = false,
        other => log::warn!("ignoring {var}={other:?}: expected a boolean"),
    }
}

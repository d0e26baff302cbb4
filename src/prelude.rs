//! Re-exports the types needed for everyday use.
//!
//! # Example
//! ```rust,no_run
//! use switchgear::prelude::*;
//!
//! let switchgear = Switchgear::new(Config::builder().build().unwrap());
//! let outcome: Outcome<u32> = switchgear.execute(&Action::from_fn(|| Ok::<_, BoxError>(1)));
//! ```

pub use crate::action::{Action, ActionBuilder};
pub use crate::config::{Config, ConfigBuilder, RecognizedFailures};
pub use crate::error::{BoxError, Failure};
pub use crate::outcome::Outcome;
pub use crate::state::Strategy;
pub use crate::switchgear::Switchgear;

//! Domain models for epicflow.
//!
//! # Core Concepts
//!
//! - [`Epic`]: A large unit of work, decomposed once into an ordered list of features.
//! - [`Feature`]: A deliverable slice of an epic that moves through the lifecycle
//!   [`Stage`]s. Every feature belongs to exactly one epic.
//! - [`Task`]: Ephemeral checklist item bound to a feature's current stage. Tasks are
//!   replaced on every stage change; only the event log remembers them.
//! - [`LifecycleEvent`]: Append-only record of every transition attempt.
//! - [`OrchestrationPlan`]: Immutable audit artifact produced by each scheduling pass.

/// Implements `as_str`, `FromStr` and `Display` for a fieldless enum stored as text.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown {} '{}'",
                        stringify!($ty).to_lowercase(),
                        other
                    )),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }
    };
}

mod epic;
mod event;
mod feature;
mod plan;
mod task;

pub use epic::*;
pub use event::*;
pub use feature::*;
pub use plan::*;
pub use task::*;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

/// Generate an identifier of the form `{kind}_{unixTimestamp}_{processId}_{suffix}`.
///
/// The random suffix keeps ids unique when one process creates several
/// records within the same second.
pub fn generate_id(kind: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}_{}",
        kind,
        Utc::now().timestamp(),
        std::process::id(),
        &suffix[..8]
    )
}

/// The current time, truncated to the microsecond precision timestamps are
/// stored with, so that a record reads back equal to what was written.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so that stored timestamps sort lexicographically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

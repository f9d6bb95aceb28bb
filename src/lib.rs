//! flagspec evaluates feature flags against a declarative, versioned specification.
//!
//! A [Specification] bundles typed context [Property] declarations, reusable [Segment]s and
//! [FeatureFlag]s whose targeting rules are trees of [Condition]s. [evaluate] is the pure core: it
//! runs one flag against one [EvaluationContext] and explains the outcome in a [Detail].
//!
//! [Client] wraps that core with everything a long-running service needs: it fetches the
//! specification through a host-provided [SpecLoader] (validated by a single-use [SpecValidator]),
//! retries and times out loads, caches and refreshes the result, and answers with emergency
//! fallbacks when no usable flag is available. Observable happenings are reported as
//! [ClientEvent]s.

mod client;
mod condition;
mod config;
mod context;
mod eval;
mod events;
mod flag;
mod flag_value;
mod loader;
mod property;
mod rollout;
mod segment;
mod spec;
mod store;
mod test_common;
mod util;
mod validation;

pub use client::*;
pub use condition::*;
pub use config::*;
pub use context::*;
pub use eval::*;
pub use events::*;
pub use flag::*;
pub use flag_value::*;
pub use loader::*;
pub use property::*;
pub use rollout::*;
pub use segment::*;
pub use spec::*;
pub use store::*;
pub use validation::*;

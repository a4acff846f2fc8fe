//! # Path Policy Engine
//!
//! Parses path policies and compiles them into the in-memory form used by the
//! telemetry verifier.
//!
//! A policy declares probe connections (`1 -> 2`) and checks that bind a flow
//! literal to the chain of probes matching flows must traverse:
//!
//! ```text
//! 1 -> 2
//! 2 -> 3
//! (10.0.0.0/24, 0.0.0.0/0, 6, 80, 0): 1 -> 2 -> 3
//! ```

pub mod addressing;
pub mod builder;
pub mod error;
pub mod grammar;
pub mod policy;

pub use addressing::{AddressError, Prefix};
pub use builder::{build_policy, PolicyBuilder};
pub use error::{PolicyError, Position, Result, SyntaxError};
pub use grammar::{parse, Node, Rule, SyntaxTree};
pub use policy::{digest_text, Chain, FlowMatcher, Policy, ProbeId, Query, INGRESS_PROBE};

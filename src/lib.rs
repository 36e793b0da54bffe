//! AgentCom - single-node agent coordination hub.
//!
//! Accepts high-level goals, decomposes them into dependent tasks through
//! an LLM planner, pushes tasks to a fleet of remote agents over
//! persistent WebSockets, and drives itself through an autonomous cycle
//! of resting, executing, improving, contemplating, and healing.

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

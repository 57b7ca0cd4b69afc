//! Shared doubles and behavioural tests for the sandbox manager.

pub(crate) mod support;

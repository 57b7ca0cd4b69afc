//! Test suites for the sandbox service bootstrap.

mod behaviour;
mod support;

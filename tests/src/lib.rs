//! Cross-crate tests for the translation core. Nothing here is public;
//! the crate exists to exercise the IR, backends, cache and dispatcher
//! together on real generated code.

#[cfg(test)]
mod backend;
#[cfg(test)]
mod exec;

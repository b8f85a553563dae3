//! Cross-crate integration tests for relgate live under `tests/`.

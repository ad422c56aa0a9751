//! End-to-end tests for qgather live in `tests/`.

//! Integration tests for the mailflow delivery pipeline.
//!
//! The tests live under `tests/` and drive the full pipeline — submission,
//! queues, worker, transport — against the in-memory broker on a manually
//! advanced clock.

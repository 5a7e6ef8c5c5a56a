//! End-to-end tests live under tests/; this crate only hosts them.

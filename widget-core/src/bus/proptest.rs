//! Property-based tests for the message bus.

//! Tests for the gcast-group crate.

mod helpers;

mod flush;

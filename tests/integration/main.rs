//! Integration tests for the backup driver
//!
//! These tests use wiremock to stand in for the content API and drive the
//! full backup cycle end-to-end. The driver runs on a plain thread (the
//! save pipeline is blocking); tokio only hosts the mock server.

mod backup_tests;

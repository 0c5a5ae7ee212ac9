// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stackwatch - Cross-Account Drift Detection
//!
//! This crate tracks configuration drift of CloudFormation stacks living in
//! externally-owned accounts. Owners grant a cross-account role; stackwatch
//! assumes it on demand, triggers drift detection remotely, polls the
//! long-running detection out of band and reconciles the per-resource result
//! into a durable store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          API / CRUD layer                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ trigger, read
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        stackwatch (This Crate)                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │   Drift     │  │    Drift    │  │ Reconciler  │  │ Job Cleanup │     │
//! │  │  Service    │  │ Orchestrator│  │             │  │   Worker    │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! │  ┌──────────────────────┐   ┌──────────────────────┐                     │
//! │  │  Credential Broker   │   │    Drift Gateway     │                     │
//! │  │       (STS)          │   │   (CloudFormation)   │                     │
//! │  └──────────────────────┘   └──────────────────────┘                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                              │
//!           ▼                              ▼
//! ┌───────────────────────┐      ┌─────────────────────────┐
//! │ PostgreSQL / SQLite   │      │  Customer AWS accounts  │
//! │ (grants, stacks, jobs,│      │  (assumed-role sessions)│
//! │  drift snapshots)     │      └─────────────────────────┘
//! └───────────────────────┘
//! ```
//!
//! # Drift Job State Machine
//!
//! ```text
//!                   trigger
//!                      │
//!                      ▼
//!               ┌─────────────┐  remote IN_PROGRESS
//!               │ IN_PROGRESS │◄────────────┐
//!               └──────┬──────┘─────────────┘
//!          ┌───────────┼─────────────┬──────────────┐
//!   IN_SYNC│    DRIFTED│       FAILED│   superseded,│
//!          │           │   or revoked│  grant gone  │
//!          ▼           ▼             ▼              ▼
//!    ┌──────────┐ ┌──────────┐  ┌────────┐    ┌────────┐
//!    │ COMPLETE │ │ COMPLETE │  │ FAILED │    │ FAILED │
//!    └──────────┘ └────┬─────┘  └────────┘    └────────┘
//!                      │ reconciler writes snapshot
//!                      ▼
//!               stack DRIFTED
//! ```
//!
//! Jobs still `IN_PROGRESS` after the retention window are no longer polled
//! and are reported as stale by the read API.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STACKWATCH_DATABASE_URL` | Yes | - | PostgreSQL URL, or `sqlite:` URL |
//! | `STACKWATCH_POLL_INTERVAL_SECS` | No | `60` | Tick period |
//! | `STACKWATCH_JOB_RETENTION_HOURS` | No | `24` | Polling window and stale threshold |
//! | `STACKWATCH_REMOTE_TIMEOUT_SECS` | No | `30` | Bound on every remote call |
//! | `STACKWATCH_MAX_CONCURRENT_JOBS` | No | `8` | Jobs processed concurrently per tick |
//! | `STACKWATCH_SESSION_NAME` | No | `stackwatch` | Assume-role session name |
//! | `STACKWATCH_AWS_ENDPOINT_URL` | No | - | Remote endpoint override |
//! | `STACKWATCH_JOB_CLEANUP_ENABLED` | No | `false` | Delete old terminal jobs |
//! | `STACKWATCH_JOB_CLEANUP_MAX_AGE_DAYS` | No | `30` | Age of deleted terminal jobs |
//!
//! # Modules
//!
//! - [`broker`]: Assumed-role sessions
//! - [`gateway`]: Remote drift detection calls
//! - [`store`]: Persistence for grants, stacks, jobs and drift snapshots
//! - [`orchestrator`]: Periodic tick driving outstanding jobs
//! - [`reconciler`]: Atomic drift snapshot replacement
//! - [`service`]: Trigger path and read projections
//! - [`runtime`]: Embeddable runtime wiring it all together

#![deny(missing_docs)]

/// Database migrations for both store backends.
pub mod migrations;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types and the permanent / transient / inconsistent taxonomy.
pub mod error;

/// Domain records and status enums.
pub mod types;

/// Resource kind lookup over CloudFormation resource types.
pub mod resource_kind;

/// Credential broker: exchanges a role grant for a short-lived session.
pub mod broker;

/// Remote operation gateway for stack listing and drift detection.
pub mod gateway;

/// Job store trait and its PostgreSQL and SQLite backends.
pub mod store;

/// Writes resource drift snapshots for drifted stacks.
pub mod reconciler;

/// Background drift job orchestrator.
pub mod orchestrator;

/// Owner-scoped drift operations consumed by the API layer.
pub mod service;

/// Background worker for deleting old terminal jobs.
pub mod job_cleanup_worker;

/// Embeddable runtime.
pub mod runtime;

pub use error::{Error, ErrorClass, Result};

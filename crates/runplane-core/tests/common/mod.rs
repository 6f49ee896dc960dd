// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runplane-core integration tests.
//!
//! Every test gets its own in-memory SQLite database behind a single
//! connection.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;

use runplane_core::authz::{Action, Authorizer, Subject};
use runplane_core::persistence::SqlitePersistence;
use runplane_core::service::{RunService, RunServiceBuilder};

/// JSON plan with two additions and one replacement.
pub const PLAN_WITH_CHANGES: &[u8] = br#"{
    "format_version": "1.2",
    "resource_changes": [
        {"address": "aws_instance.web", "change": {"actions": ["create"]}},
        {"address": "aws_s3_bucket.logs", "change": {"actions": ["create"]}},
        {"address": "aws_iam_role.ci", "change": {"actions": ["delete", "create"]}}
    ]
}"#;

/// JSON plan where nothing changes.
pub const PLAN_WITHOUT_CHANGES: &[u8] = br#"{
    "format_version": "1.2",
    "resource_changes": [
        {"address": "aws_instance.web", "change": {"actions": ["no-op"]}}
    ]
}"#;

/// Tail of a successful apply log.
pub const APPLY_LOG: &[u8] = b"aws_instance.web: Creating...\n\
    aws_instance.web: Creation complete after 3s [id=i-0abc]\n\
    \n\
    Apply complete! Resources: 2 added, 0 changed, 1 destroyed.\n";

/// Allows only subjects whose id is listed.
pub struct AllowSubjects(pub Vec<&'static str>);

#[async_trait]
impl Authorizer for AllowSubjects {
    async fn can_access(&self, subject: &Subject, _action: Action, _workspace_id: &str) -> bool {
        self.0.contains(&subject.id.as_str())
    }
}

/// Fresh, migrated SQLite persistence.
pub async fn persistence() -> Arc<SqlitePersistence> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    runplane_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");

    Arc::new(SqlitePersistence::new(pool))
}

/// Builder over a fresh database with no force-cancel cooldown.
pub async fn builder() -> RunServiceBuilder {
    RunService::builder()
        .persistence(persistence().await)
        .force_cancel_cooldown(Duration::ZERO)
}

/// Service over a fresh database.
pub async fn service() -> RunService {
    builder().await.build().expect("service should build")
}

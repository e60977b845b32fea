// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! PostgreSQL connection pool wrapper.
//!
//! Wraps `sqlx::PgPool` in a thin `Database` newtype injected into the
//! repository implementations.

use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(connection_string)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

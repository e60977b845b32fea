// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Daemon configuration loaded from the environment.

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub redis_url: String,
    pub docker_socket: Option<String>,
    pub master_key: String,
    pub workspace_image: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_addr: std::env::var("TERMFLUX_BIND").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into()),
            docker_socket: std::env::var("DOCKER_SOCKET").ok(),
            master_key: std::env::var("TERMFLUX_MASTER_KEY")
                .context("TERMFLUX_MASTER_KEY is required")?,
            workspace_image: std::env::var("TERMFLUX_IMAGE")
                .unwrap_or_else(|_| "termflux/workspace:latest".into()),
        })
    }
}

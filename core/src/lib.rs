// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Termflux runtime core.
//!
//! The middle layer between the HTTP/UI surfaces and the host container
//! runtime: workspace lifecycle, the terminal session gateway, the
//! workflow execution engine, the session/state cache and the secret
//! store.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

pub mod provisioner;
pub mod secret_service;
pub mod terminal_gateway;
pub mod workflow_engine;

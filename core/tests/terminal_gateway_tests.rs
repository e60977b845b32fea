// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Terminal gateway service tests: authentication cache-through, attach
//! and reattach, replay buffers, single-writer takeover and lifecycle
//! transitions, against the scripted driver and in-memory stores.

mod support;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;

use support::MockDriver;
use termflux_core::application::terminal_gateway::TerminalGateway;
use termflux_core::domain::cache::CacheStore;
use termflux_core::domain::container::ContainerStatus;
use termflux_core::domain::repository::{AuthToken, SessionRepository, WorkspaceRepository};
use termflux_core::domain::session::{SessionStatus, TerminalSize};
use termflux_core::domain::workspace::{ContainerHandle, Workspace};
use termflux_core::infrastructure::cache::MemoryCache;
use termflux_core::infrastructure::repositories::{
    InMemoryAuthTokenRepository, InMemorySessionRepository, InMemoryWorkspaceRepository,
};

struct Harness {
    gateway: TerminalGateway,
    driver: Arc<MockDriver>,
    cache: Arc<MemoryCache>,
    sessions: Arc<InMemorySessionRepository>,
    workspaces: Arc<InMemoryWorkspaceRepository>,
    tokens: Arc<InMemoryAuthTokenRepository>,
}

fn harness() -> Harness {
    let driver = Arc::new(MockDriver::new());
    let cache = Arc::new(MemoryCache::new());
    let sessions = Arc::new(InMemorySessionRepository::new());
    let workspaces = Arc::new(InMemoryWorkspaceRepository::new());
    let tokens = Arc::new(InMemoryAuthTokenRepository::new());
    let gateway = TerminalGateway::new(
        driver.clone(),
        cache.clone(),
        sessions.clone(),
        workspaces.clone(),
        tokens.clone(),
    );
    Harness {
        gateway,
        driver,
        cache,
        sessions,
        workspaces,
        tokens,
    }
}

async fn seed_workspace(h: &Harness, user_id: &str) -> Workspace {
    let mut workspace = Workspace::new("dev-box", user_id);
    workspace.mark_running(ContainerHandle::new("c1"));
    h.workspaces.save(&workspace).await.unwrap();
    workspace
}

fn seed_token(h: &Harness, token: &str, user_id: &str) {
    h.tokens.insert(AuthToken {
        token: token.to_string(),
        user_id: user_id.to_string(),
        expires_at: Utc::now() + ChronoDuration::hours(1),
    });
}

#[tokio::test]
async fn authenticate_falls_back_to_the_relational_table_and_backfills() {
    let h = harness();
    seed_token(&h, "tok-1", "user-1");

    assert_eq!(h.gateway.authenticate("tok-1").await.unwrap(), "user-1");
    // Second resolve is served by the cache.
    assert_eq!(
        h.cache.get_auth_token("tok-1").await.unwrap().as_deref(),
        Some("user-1")
    );
    assert!(h.gateway.authenticate("bogus").await.is_err());
    assert!(h.gateway.authenticate("").await.is_err());
}

#[tokio::test]
async fn new_session_creates_tmux_session_and_cache_record() {
    let h = harness();
    let workspace = seed_workspace(&h, "user-1").await;

    let opened = h
        .gateway
        .open_session(
            "user-1",
            workspace.id,
            None,
            TerminalSize { cols: 120, rows: 40 },
        )
        .await
        .unwrap();

    assert!(opened.replay.is_none());
    assert_eq!(opened.session.status, SessionStatus::Active);

    let commands = h.driver.commands();
    let name = opened.session.multiplexer_name();
    assert!(commands
        .iter()
        .any(|c| c.contains("tmux new-session") && c.contains(&name) && c.contains("-x 120")));
    assert!(commands
        .iter()
        .any(|c| c.contains("tmux attach-session") && c.contains(&name)));

    let cached = h.cache.get_session(&opened.session.id).await.unwrap().unwrap();
    assert_eq!(cached.multiplexer_name, name);
    assert_eq!(cached.user_id, "user-1");
}

#[tokio::test]
async fn attach_requires_ownership_and_a_running_container() {
    let h = harness();
    let workspace = seed_workspace(&h, "user-1").await;

    let err = h
        .gateway
        .open_session("intruder", workspace.id, None, TerminalSize::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("access denied"));

    h.driver.set_status(ContainerStatus::Stopped);
    let err = h
        .gateway
        .open_session("user-1", workspace.id, None, TerminalSize::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not running"));
}

#[tokio::test]
async fn reattach_replays_the_buffer_as_a_single_prefix() {
    let h = harness();
    let workspace = seed_workspace(&h, "user-1").await;

    let opened = h
        .gateway
        .open_session("user-1", workspace.id, None, TerminalSize::default())
        .await
        .unwrap();
    let session_id = opened.session.id.clone();

    h.gateway.append_output(&session_id, "hello ").await.unwrap();
    h.gateway.append_output(&session_id, "world").await.unwrap();
    h.gateway
        .mark_disconnected(&session_id, opened.connection_id)
        .await
        .unwrap();

    let reopened = h
        .gateway
        .open_session(
            "user-1",
            workspace.id,
            Some(session_id.clone()),
            TerminalSize::default(),
        )
        .await
        .unwrap();

    assert_eq!(reopened.replay.as_deref(), Some("hello world"));
    assert_eq!(reopened.session.status, SessionStatus::Active);
}

#[tokio::test]
async fn reattach_by_another_user_is_denied() {
    let h = harness();
    let workspace = seed_workspace(&h, "user-1").await;
    let mut other = Workspace::new("other-box", "user-2");
    other.mark_running(ContainerHandle::new("c2"));
    h.workspaces.save(&other).await.unwrap();

    let opened = h
        .gateway
        .open_session("user-1", workspace.id, None, TerminalSize::default())
        .await
        .unwrap();

    let err = h
        .gateway
        .open_session(
            "user-2",
            other.id,
            Some(opened.session.id.clone()),
            TerminalSize::default(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("access denied"));
}

#[tokio::test]
async fn second_attach_kicks_the_prior_writer() {
    let h = harness();
    let workspace = seed_workspace(&h, "user-1").await;

    let mut first = h
        .gateway
        .open_session("user-1", workspace.id, None, TerminalSize::default())
        .await
        .unwrap();
    let session_id = first.session.id.clone();

    let second = h
        .gateway
        .open_session(
            "user-1",
            workspace.id,
            Some(session_id.clone()),
            TerminalSize::default(),
        )
        .await
        .unwrap();

    // The first connection observes the takeover signal.
    assert!(first.kick.try_recv().is_ok());

    // The first connection's late disconnect must not clobber the second
    // writer: the session stays active.
    h.gateway
        .mark_disconnected(&session_id, first.connection_id)
        .await
        .unwrap();
    let cached = h.cache.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(cached.status, SessionStatus::Active);

    // Once the current writer disconnects, the transition applies.
    h.gateway
        .mark_disconnected(&session_id, second.connection_id)
        .await
        .unwrap();
    let cached = h.cache.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(cached.status, SessionStatus::Disconnected);
}

#[tokio::test]
async fn disconnect_preserves_session_and_buffer() {
    let h = harness();
    let workspace = seed_workspace(&h, "user-1").await;

    let opened = h
        .gateway
        .open_session("user-1", workspace.id, None, TerminalSize::default())
        .await
        .unwrap();
    let session_id = opened.session.id.clone();
    h.gateway.append_output(&session_id, "kept").await.unwrap();

    h.gateway
        .mark_disconnected(&session_id, opened.connection_id)
        .await
        .unwrap();

    let row = h.sessions.find_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Disconnected);
    assert!(row.closed_at.is_none());
    assert_eq!(h.cache.read_buffer(&session_id).await.unwrap(), vec!["kept"]);
}

#[tokio::test]
async fn terminate_marks_the_row_closed_and_clears_cache() {
    let h = harness();
    let workspace = seed_workspace(&h, "user-1").await;

    let opened = h
        .gateway
        .open_session("user-1", workspace.id, None, TerminalSize::default())
        .await
        .unwrap();
    let session_id = opened.session.id.clone();
    h.gateway.append_output(&session_id, "bye").await.unwrap();

    h.gateway
        .mark_terminated(&session_id, opened.connection_id)
        .await
        .unwrap();

    let row = h.sessions.find_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Terminated);
    assert!(row.closed_at.is_some());
    assert!(h.cache.get_session(&session_id).await.unwrap().is_none());
    assert!(h.cache.read_buffer(&session_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_session_kills_the_multiplexer_session() {
    let h = harness();
    let workspace = seed_workspace(&h, "user-1").await;

    let opened = h
        .gateway
        .open_session("user-1", workspace.id, None, TerminalSize::default())
        .await
        .unwrap();
    let session_id = opened.session.id.clone();
    let name = opened.session.multiplexer_name();

    h.gateway.delete_session(&session_id).await.unwrap();

    assert!(h
        .driver
        .commands()
        .iter()
        .any(|c| c.contains("tmux kill-session") && c.contains(&name)));
    let row = h.sessions.find_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Terminated);
}

#[tokio::test]
async fn resize_forwards_to_tmux_and_updates_geometry() {
    let h = harness();
    let workspace = seed_workspace(&h, "user-1").await;

    let opened = h
        .gateway
        .open_session("user-1", workspace.id, None, TerminalSize::default())
        .await
        .unwrap();
    let session_id = opened.session.id.clone();

    h.gateway
        .resize(&session_id, TerminalSize { cols: 120, rows: 40 })
        .await;

    assert!(h
        .driver
        .commands()
        .iter()
        .any(|c| c.contains("tmux resize-window") && c.contains("-x 120") && c.contains("-y 40")));
    let row = h.sessions.find_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(row.size, TerminalSize { cols: 120, rows: 40 });
}

#[tokio::test]
async fn list_sessions_downgrades_active_rows_without_cache_records() {
    let h = harness();
    let workspace = seed_workspace(&h, "user-1").await;

    let opened = h
        .gateway
        .open_session("user-1", workspace.id, None, TerminalSize::default())
        .await
        .unwrap();
    let session_id = opened.session.id.clone();

    // Simulate TTL expiry of the cache record.
    h.cache.remove_session(&session_id).await.unwrap();

    let listed = h.gateway.list_sessions(workspace.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, SessionStatus::Disconnected);

    let swept = h.gateway.sweep_stale_sessions(workspace.id).await.unwrap();
    assert_eq!(swept, 1);
    let row = h.sessions.find_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Disconnected);
}

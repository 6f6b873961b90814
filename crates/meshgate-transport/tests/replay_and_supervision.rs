//! Cross-module properties of the transport layer: event-ring replay
//! ordering and subprocess supervision bounds.

use std::sync::Arc;
use std::time::Duration;

use meshgate_transport::sse::EventRing;
use meshgate_transport::{
    CreateConnection, ManagerConfig, SessionState, TransportManager, TransportType,
};
use proptest::prelude::*;
use serde_json::json;

proptest! {
    /// A reconnecting consumer that presents mark `k` sees every retained
    /// event with id > k, in strictly increasing order, with no gaps
    /// inside the retained range.
    #[test]
    fn replay_after_mark_is_gapless_and_ordered(
        total in 1u64..200,
        capacity in 1usize..64,
        mark in 0u64..220,
    ) {
        let ring = EventRing::new(capacity);
        for i in 0..total {
            ring.publish("n", json!(i));
        }
        let replay = ring.events_after(mark);

        // Strictly increasing, gapless ids.
        for pair in replay.windows(2) {
            prop_assert_eq!(pair[1].id, pair[0].id + 1);
        }
        // Everything replayed is newer than the mark.
        for event in &replay {
            prop_assert!(event.id > mark);
        }
        // The retained suffix past the mark is fully covered.
        let oldest_retained = total.saturating_sub(capacity as u64) + 1;
        let expected_from = oldest_retained.max(mark + 1);
        let expected: u64 = total.saturating_sub(expected_from - 1);
        prop_assert_eq!(replay.len() as u64, expected);
    }

    /// Ids never repeat and never decrease, overflow or not.
    #[test]
    fn ids_are_strictly_monotone(publishes in 1usize..300, capacity in 1usize..16) {
        let ring = EventRing::new(capacity);
        let mut last = 0;
        for _ in 0..publishes {
            let id = ring.publish("n", json!(null));
            prop_assert!(id > last);
            last = id;
        }
    }
}

#[cfg(unix)]
mod supervision {
    use super::*;
    use meshgate_transport::{LaunchSpec, TransportConnection};

    fn stdio_params(command: &str, args: &[&str]) -> CreateConnection {
        CreateConnection {
            transport: TransportType::Stdio,
            tenant: "t".into(),
            user: "u".into(),
            backend_id: None,
            namespace: None,
            client_id: None,
            launch: Some(LaunchSpec {
                command: command.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                env: Default::default(),
                cwd: None,
            }),
        }
    }

    fn process_alive(pid: u32) -> bool {
        // Signal 0 probes existence without delivering anything.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    /// No close path leaves the child alive past the kill grace, even for
    /// a child that ignores stdin EOF.
    #[tokio::test]
    async fn close_reaps_a_sleeping_child_within_the_grace() {
        let manager = Arc::new(TransportManager::new(ManagerConfig::default()));
        let (conn, _) = manager
            .create_connection(stdio_params("sleep", &["300"]))
            .await
            .expect("spawn sleep");
        let session_id = conn.session_id();
        let pid = manager
            .stdio()
            .connection(session_id)
            .and_then(|c| c.pid())
            .expect("child pid");
        assert!(process_alive(pid));

        let started = std::time::Instant::now();
        assert!(manager.close(session_id).await);
        // Kill grace is 5s by default; TERM kills sleep immediately.
        assert!(started.elapsed() < Duration::from_secs(6));

        // Allow the OS a moment to reap.
        for _ in 0..50 {
            if !process_alive(pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!process_alive(pid));
        assert!(manager
            .store()
            .get(session_id)
            .expect("record kept")
            .state
            .is_terminal());
    }

    /// Shutdown with many live bridge sessions reaps every child.
    #[tokio::test]
    async fn shutdown_reaps_every_child() {
        let manager = Arc::new(TransportManager::new(ManagerConfig::default()));
        let mut pids = Vec::new();
        for _ in 0..5 {
            let (conn, _) = manager
                .create_connection(stdio_params("cat", &[]))
                .await
                .expect("spawn cat");
            let pid = manager
                .stdio()
                .connection(conn.session_id())
                .and_then(|c| c.pid())
                .expect("child pid");
            pids.push(pid);
        }
        assert_eq!(manager.stats().live_sessions, 5);

        manager.shutdown().await;

        assert_eq!(manager.stats().live_sessions, 0);
        for pid in pids {
            for _ in 0..50 {
                if !process_alive(pid) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert!(!process_alive(pid), "pid {pid} still alive after shutdown");
        }
    }

    /// A child that exits on its own flips the session terminal without
    /// any close call.
    #[tokio::test]
    async fn self_exit_is_observed() {
        let manager = Arc::new(TransportManager::new(ManagerConfig::default()));
        let (conn, _) = manager
            .create_connection(stdio_params("false", &[]))
            .await
            .expect("spawn false");
        let session_id = conn.session_id();

        for _ in 0..100 {
            if manager
                .store()
                .get(session_id)
                .is_ok_and(|s| s.state.is_terminal())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // `false` exits 1: the session errored rather than closed.
        assert_eq!(
            manager.store().get(session_id).expect("record").state,
            SessionState::Error
        );
    }
}

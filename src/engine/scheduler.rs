//! # Scheduler
//!
//! Periodic maintenance loops. Each runs on a tokio interval until the engine
//! is cancelled:
//!
//! - **KCP update**: drives the retransmission timers of every KCP session,
//!   one task per session
//! - **Session sweep**: closes idle sessions and orphans (never associated to a player)
//! - **Statistics**: logs a statistics snapshot
//!
//! Sweeps iterate the manager's session snapshot, so sessions may be created
//! or closed while a sweep runs.

use crate::session::{DisconnectCause, Session, SessionHandle, SessionManager};
use crate::utils::metrics::{NetworkStatistics, Timer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

fn ticker(period: Duration) -> tokio::time::Interval {
    // First tick one period from now instead of immediately
    let mut interval = interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Open KCP sessions in the current snapshot.
fn kcp_sessions(manager: &SessionManager) -> Vec<Arc<Session>> {
    manager
        .sessions()
        .iter()
        .filter(|session| matches!(session.handle(), SessionHandle::Kcp { .. }) && !session.is_closed())
        .cloned()
        .collect()
}

/// Update one KCP control block. A failed update closes the session.
pub fn update_kcp_session(manager: &SessionManager, session: &Arc<Session>, now_ms: u32) -> bool {
    let SessionHandle::Kcp { channel } = session.handle() else {
        return false;
    };
    match channel.update(now_ms) {
        Ok(()) => true,
        Err(e) => {
            warn!(session_id = session.id(), error = %e, "KCP update failed");
            manager.close_session(session, DisconnectCause::LostInWritten);
            false
        }
    }
}

/// Submit one update task per KCP session on every tick, so a slow control
/// block only holds up its own update. `epoch` anchors the millisecond clock.
pub async fn kcp_update_loop(
    manager: Arc<SessionManager>,
    period: Duration,
    tasks: TaskTracker,
    cancel: CancellationToken,
) {
    let epoch = Instant::now();
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let now_ms = epoch.elapsed().as_millis() as u32;
                for session in kcp_sessions(&manager) {
                    let manager = manager.clone();
                    tasks.spawn(async move {
                        update_kcp_session(&manager, &session, now_ms);
                    });
                }
            }
        }
    }
    debug!("KCP update loop stopped");
}

/// Result of one session sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub idle: usize,
    pub orphan: usize,
}

/// Close idle sessions, then sessions still unassociated after `orphan_allowance`.
///
/// A zero allowance disables the orphan check.
pub fn sweep_sessions(manager: &SessionManager, orphan_allowance: Duration) -> SweepReport {
    let _timer = Timer::start("session_sweep");
    let mut report = SweepReport::default();

    for session in manager.sessions().iter() {
        if session.is_closed() {
            continue;
        }
        if session.is_idle() {
            if manager.close_session(session, DisconnectCause::Idle) {
                report.idle += 1;
            }
        } else if !orphan_allowance.is_zero()
            && session.is_orphan(orphan_allowance)
            && manager.close_session(session, DisconnectCause::Orphan)
        {
            report.orphan += 1;
        }
    }

    if report.idle + report.orphan > 0 {
        info!(idle = report.idle, orphan = report.orphan, "Sessions swept");
    }
    report
}

pub async fn session_sweep_loop(
    manager: Arc<SessionManager>,
    period: Duration,
    orphan_allowance: Duration,
    cancel: CancellationToken,
) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                sweep_sessions(&manager, orphan_allowance);
            }
        }
    }
    debug!("Session sweep loop stopped");
}

pub async fn statistics_loop(statistics: Arc<NetworkStatistics>, period: Duration, cancel: CancellationToken) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => statistics.log_statistics(),
        }
    }
    debug!("Statistics loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::kcp::KcpChannel;
    use crate::error::Result;
    use crate::protocol::dispatcher::Dispatcher;
    use crate::session::{ChannelId, SessionSettings};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    fn manager(max_idle_time: Duration) -> SessionManager {
        let settings = SessionSettings {
            max_idle_time,
            ..SessionSettings::default()
        };
        SessionManager::new(settings, Arc::new(Dispatcher::new()), Arc::new(NetworkStatistics::new()))
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_orphans_are_closed_but_associated_sessions_stay() {
        let manager = manager(Duration::ZERO);
        let (tx, _rx) = mpsc::channel(1);
        let orphan = manager.create_socket_session(ChannelId(1), peer(1), tx.clone()).unwrap();
        let player = manager.create_socket_session(ChannelId(2), peer(2), tx).unwrap();
        manager.associate_player(&player, "alice").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let report = sweep_sessions(&manager, Duration::from_millis(5));

        assert_eq!(report, SweepReport { idle: 0, orphan: 1 });
        assert!(orphan.is_closed());
        assert!(!player.is_closed());
        assert_eq!(manager.statistics().closed_with(DisconnectCause::Orphan), 1);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_idle_sessions_are_closed() {
        let manager = manager(Duration::from_millis(5));
        let (tx, _rx) = mpsc::channel(1);
        let session = manager.create_socket_session(ChannelId(1), peer(1), tx).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let report = sweep_sessions(&manager, Duration::ZERO);

        assert_eq!(report.idle, 1);
        assert!(session.is_closed());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zero_allowance_disables_orphan_sweep() {
        let manager = manager(Duration::ZERO);
        let (tx, _rx) = mpsc::channel(1);
        manager.create_socket_session(ChannelId(1), peer(1), tx).unwrap();
        assert_eq!(sweep_sessions(&manager, Duration::ZERO), SweepReport::default());
        assert_eq!(manager.session_count(), 1);
    }

    struct CountingChannel {
        updates: AtomicU32,
    }

    impl KcpChannel for CountingChannel {
        fn conv(&self) -> u32 {
            9
        }
        fn peer(&self) -> SocketAddr {
            peer(9)
        }
        fn input(&self, _segment: &[u8]) -> Result<()> {
            Ok(())
        }
        fn recv(&self) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn send(&self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn update(&self, _now_ms: u32) -> Result<()> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_kcp_update_reaches_kcp_sessions_only() {
        let manager = manager(Duration::ZERO);
        let channel = Arc::new(CountingChannel {
            updates: AtomicU32::new(0),
        });
        manager.create_kcp_session(channel.clone()).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        manager.create_socket_session(ChannelId(1), peer(1), tx).unwrap();

        let targets = kcp_sessions(&manager);
        assert_eq!(targets.len(), 1);
        assert!(update_kcp_session(&manager, &targets[0], 10));
        assert_eq!(channel.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn test_kcp_update_loop_runs_updates_as_tasks() {
        let manager = Arc::new(manager(Duration::ZERO));
        let channel = Arc::new(CountingChannel {
            updates: AtomicU32::new(0),
        });
        manager.create_kcp_session(channel.clone()).unwrap();

        let tasks = TaskTracker::new();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(kcp_update_loop(
            manager.clone(),
            Duration::from_millis(5),
            tasks.clone(),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        handle.await.unwrap();
        tasks.close();
        tasks.wait().await;

        assert!(channel.updates.load(Ordering::SeqCst) >= 2);
    }
}

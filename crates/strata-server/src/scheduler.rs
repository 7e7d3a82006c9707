//! Periodic work: the position broadcast and the keepalive sweep.
//!
//! Both ticks run on the core task alongside packet handling, so they see a
//! consistent registry. A tick that falls behind is skipped rather than
//! replayed in a burst.

use std::time::{Duration, Instant};

use strata_config::TimingConfig;
use strata_net::ServerPacket;
use tokio::time::{Interval, MissedTickBehavior};

use crate::dispatcher::{DisconnectReason, Dispatcher, Outbox};

/// The two fixed-rate timers driving the core loop.
pub struct Ticks {
    pub position: Interval,
    pub keepalive: Interval,
}

impl Ticks {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            position: skipping_interval(timing.position_tick()),
            keepalive: skipping_interval(timing.keepalive_tick()),
        }
    }
}

/// An interval whose first tick is one period from now.
fn skipping_interval(period: Duration) -> Interval {
    // tokio panics on a zero period.
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

impl Dispatcher {
    /// Sends one NEWPOSITION with every pose that changed since the last
    /// tick to every user. Sends nothing if nobody moved.
    pub fn position_tick(&mut self, out: &mut Outbox) {
        let poses = self.sessions.take_dirty_poses();
        if poses.is_empty() {
            return;
        }
        self.broadcast(&ServerPacket::NewPosition(poses), out);
    }

    /// Evicts users silent for longer than the grace period and pings the
    /// rest. Returns how many were evicted.
    pub fn keepalive_tick(&mut self, now: Instant, out: &mut Outbox) -> usize {
        let expired = self.sessions.timed_out(now, self.settings.keepalive_grace);
        for &index in &expired {
            self.drop_session(index, DisconnectReason::Timeout, out);
        }
        self.broadcast(&ServerPacket::KeepAlive, out);
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::{addr, connect, datagrams, dispatcher};
    use strata_config::WorldMode;

    #[test]
    fn test_position_tick_only_sends_movers() {
        let mut d = dispatcher(WorldMode::Edit);
        connect(&mut d, "alice", 1000);
        connect(&mut d, "bob", 2000);

        let mut out = Outbox::new();
        d.position_tick(&mut out);
        assert!(out.is_empty());

        d.handle_datagram(addr(2000), b"3\t1\t1\t2\t3\t0\t0\t0\t0", Instant::now(), &mut out);
        d.position_tick(&mut out);
        let expected = "3\t1\t1\t2\t3\t0\t0\t0\t0".to_string();
        assert_eq!(
            datagrams(&mut out),
            vec![(1000, expected.clone()), (2000, expected)]
        );

        // Moved once, reported once.
        d.position_tick(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_position_tick_batches_movers() {
        let mut d = dispatcher(WorldMode::Edit);
        connect(&mut d, "alice", 1000);
        connect(&mut d, "bob", 2000);

        let mut out = Outbox::new();
        d.handle_datagram(addr(2000), b"3\t1\t5\t0\t0\t0\t0\t0\t0", Instant::now(), &mut out);
        d.handle_datagram(addr(1000), b"3\t0\t7\t0\t0\t0\t0\t0\t0", Instant::now(), &mut out);
        d.position_tick(&mut out);

        let sent = datagrams(&mut out);
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0].1,
            "3\t0\t7\t0\t0\t0\t0\t0\t0\t1\t5\t0\t0\t0\t0\t0\t0"
        );
    }

    #[test]
    fn test_keepalive_pings_live_users() {
        let mut d = dispatcher(WorldMode::Edit);
        connect(&mut d, "alice", 1000);
        connect(&mut d, "bob", 2000);

        let mut out = Outbox::new();
        assert_eq!(d.keepalive_tick(Instant::now(), &mut out), 0);
        assert_eq!(
            datagrams(&mut out),
            vec![(1000, "4".to_string()), (2000, "4".to_string())]
        );
    }

    #[test]
    fn test_keepalive_evicts_silent_user() {
        let mut d = dispatcher(WorldMode::Edit);
        let start = Instant::now();
        connect(&mut d, "alice", 1000);
        connect(&mut d, "bob", 2000);
        connect(&mut d, "carol", 3000);

        // Everyone but bob keeps talking.
        let later = start + Duration::from_secs(400);
        let mut out = Outbox::new();
        d.handle_datagram(addr(1000), b"4\t0", later, &mut out);
        d.handle_datagram(addr(3000), b"4\t2", later, &mut out);

        assert_eq!(d.keepalive_tick(later, &mut out), 1);
        let sent = datagrams(&mut out);

        let to = |port: u16| -> Vec<&str> {
            sent.iter()
                .filter(|(p, _)| *p == port)
                .map(|(_, text)| text.as_str())
                .collect()
        };
        assert_eq!(to(2000), ["1"]);
        for port in [1000, 3000] {
            assert_eq!(to(port), ["10\t1", "5\t1\tbob\tbob has disconnected", "4"]);
        }
        assert!(d.sessions().find_by_index(1).is_none());
        assert_eq!(d.sessions().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_fire_after_one_period() {
        let timing = TimingConfig {
            position_tick_ms: 20,
            keepalive_tick_ms: 6000,
            keepalive_grace_ms: 300_000,
        };
        let mut ticks = Ticks::new(&timing);
        let start = tokio::time::Instant::now();

        ticks.position.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(20));
        ticks.keepalive.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(6000));
    }
}

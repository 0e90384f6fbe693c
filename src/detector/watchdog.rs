//! Service watchdog
//!
//! Probes each configured service once per cycle and restarts the ones that
//! are down. Restart attempts are counted in a sliding window; once
//! `max_restarts` attempts fall inside the window the service is declared
//! flapping and automatic restarts stop until it comes back up, is cleared
//! by an operator, or the optional cool-down expires.

use super::{failure_detail, Event, EventKind};
use crate::config::WatchdogConfig;
use crate::platform::Platform;
use crate::store::Policy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Last observed liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Up,
    Down,
    Unknown,
}

/// Watchdog bookkeeping for one service
#[derive(Debug, Clone)]
pub struct MonitoredService {
    pub name: String,
    pub last_known_state: ServiceState,
    /// Restart attempts since the service was last seen up
    pub consecutive_restarts: u32,
    /// When each recent restart was attempted
    attempts: VecDeque<Instant>,
    /// Set while auto-restart is suspended
    flapping_since: Option<Instant>,
}

impl MonitoredService {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_known_state: ServiceState::Unknown,
            consecutive_restarts: 0,
            attempts: VecDeque::new(),
            flapping_since: None,
        }
    }

    pub fn is_flapping(&self) -> bool {
        self.flapping_since.is_some()
    }

    fn reset(&mut self) {
        self.consecutive_restarts = 0;
        self.attempts.clear();
        self.flapping_since = None;
    }
}

/// Service watchdog engine
pub struct ServiceWatchdog {
    platform: Arc<dyn Platform>,
    config: WatchdogConfig,
    services: HashMap<String, MonitoredService>,
}

impl ServiceWatchdog {
    pub fn new(config: WatchdogConfig, platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            config,
            services: HashMap::new(),
        }
    }

    pub fn service(&self, name: &str) -> Option<&MonitoredService> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &MonitoredService> {
        self.services.values()
    }

    /// Lift flapping suppression for a service. Returns false if unknown.
    pub fn clear(&mut self, name: &str) -> bool {
        match self.services.get_mut(name) {
            Some(service) => {
                service.reset();
                info!("Cleared restart suppression for {}", name);
                true
            }
            None => false,
        }
    }

    /// Run one watchdog cycle against `policy`
    pub async fn run_cycle(&mut self, policy: &Policy) -> Vec<Event> {
        let mut events = Vec::new();
        let mut next = HashMap::with_capacity(policy.services.len());

        for name in &policy.services {
            let mut service = self
                .services
                .get(name)
                .cloned()
                .unwrap_or_else(|| MonitoredService::new(name));

            self.check(&mut service, &mut events).await;
            next.insert(name.clone(), service);
        }

        self.services = next;
        events
    }

    async fn check(&self, service: &mut MonitoredService, events: &mut Vec<Event>) {
        let name = service.name.clone();

        let up = match self.platform.query_service_active(&name).await {
            Ok(up) => up,
            Err(e) => {
                // Treat an unanswerable probe as down; restart will surface
                // the underlying failure
                debug!("Liveness probe for {} failed: {}", name, e);
                false
            }
        };

        if up {
            if service.last_known_state != ServiceState::Up {
                debug!("Service {} is up", name);
            }
            service.last_known_state = ServiceState::Up;
            service.reset();
            return;
        }
        service.last_known_state = ServiceState::Down;

        let now = Instant::now();
        let window = self.config.window();
        while let Some(first) = service.attempts.front() {
            if now.duration_since(*first) > window {
                service.attempts.pop_front();
            } else {
                break;
            }
        }

        if let Some(since) = service.flapping_since {
            match self.config.cooldown() {
                Some(cooldown) if now.duration_since(since) >= cooldown => {
                    info!("Cool-down elapsed for {}, resuming restarts", name);
                    service.reset();
                }
                _ => {
                    debug!("Service {} is flapping, restart suppressed", name);
                    return;
                }
            }
        }

        events.push(Event::new(EventKind::ServiceDown, &name, "service is not active"));

        if service.attempts.len() as u32 >= self.config.max_restarts {
            service.flapping_since = Some(now);
            events.push(Event::new(
                EventKind::ServiceFlapping,
                &name,
                format!(
                    "{} restart attempts within {}s, auto-restart suspended",
                    service.attempts.len(),
                    self.config.window_secs
                ),
            ));
            return;
        }

        service.attempts.push_back(now);
        service.consecutive_restarts += 1;

        match self.platform.restart_service(&name).await {
            Ok(()) => events.push(Event::new(
                EventKind::ServiceRestarted,
                &name,
                format!("restart attempt {}", service.consecutive_restarts),
            )),
            Err(e) => events.push(Event::new(
                EventKind::RestartFailed,
                &name,
                format!(
                    "restart attempt {}: {}",
                    service.consecutive_restarts,
                    failure_detail("restart", &e)
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::taxonomy::Taxonomy;
    use crate::platform::testing::FakePlatform;
    use std::time::Duration;

    fn policy(services: &[&str]) -> Policy {
        Policy {
            revision: 0,
            paths: Vec::new(),
            services: services.iter().map(|s| s.to_string()).collect(),
            taxonomy: Taxonomy::empty(),
            scan_dirs: Vec::new(),
        }
    }

    fn watchdog(platform: Arc<FakePlatform>, cooldown_secs: Option<u64>) -> ServiceWatchdog {
        let config = WatchdogConfig {
            max_restarts: 3,
            window_secs: 300,
            cooldown_secs,
        };
        ServiceWatchdog::new(config, platform)
    }

    fn count(events: &[Event], kind: EventKind) -> usize {
        events.iter().filter(|e| e.kind == kind).count()
    }

    #[tokio::test]
    async fn test_up_service_is_left_alone() {
        let platform = Arc::new(FakePlatform::new());
        platform.set_active("nginx", true);
        let mut watchdog = watchdog(platform.clone(), None);

        assert!(watchdog.run_cycle(&policy(&["nginx"])).await.is_empty());
        assert_eq!(platform.restarts(), 0);
        assert_eq!(watchdog.service("nginx").unwrap().last_known_state, ServiceState::Up);
    }

    #[tokio::test]
    async fn test_restart_recovers() {
        let platform = Arc::new(FakePlatform::new());
        *platform.restart_heals.lock().unwrap() = true;
        let mut watchdog = watchdog(platform.clone(), None);
        let policy = policy(&["nginx"]);

        let events = watchdog.run_cycle(&policy).await;
        assert_eq!(count(&events, EventKind::ServiceDown), 1);
        assert_eq!(count(&events, EventKind::ServiceRestarted), 1);
        assert_eq!(watchdog.service("nginx").unwrap().consecutive_restarts, 1);

        assert!(watchdog.run_cycle(&policy).await.is_empty());
        assert_eq!(watchdog.service("nginx").unwrap().consecutive_restarts, 0);
    }

    #[tokio::test]
    async fn test_restart_storm_is_capped() {
        let platform = Arc::new(FakePlatform::new());
        *platform.restart_fails.lock().unwrap() = true;
        let mut watchdog = watchdog(platform.clone(), None);
        let policy = policy(&["worker"]);

        let mut all = Vec::new();
        for _ in 0..10 {
            all.extend(watchdog.run_cycle(&policy).await);
        }

        assert_eq!(platform.restarts(), 3);
        assert_eq!(count(&all, EventKind::RestartFailed), 3);
        assert_eq!(count(&all, EventKind::ServiceFlapping), 1);
        assert!(watchdog.service("worker").unwrap().is_flapping());

        // Coming back up resets the counter and suppression
        platform.set_active("worker", true);
        assert!(watchdog.run_cycle(&policy).await.is_empty());
        let service = watchdog.service("worker").unwrap();
        assert_eq!(service.consecutive_restarts, 0);
        assert!(!service.is_flapping());
    }

    #[tokio::test]
    async fn test_clear_resumes_restarts() {
        let platform = Arc::new(FakePlatform::new());
        let mut watchdog = watchdog(platform.clone(), None);
        let policy = policy(&["worker"]);

        for _ in 0..5 {
            watchdog.run_cycle(&policy).await;
        }
        assert_eq!(platform.restarts(), 3);

        assert!(watchdog.clear("worker"));
        assert!(!watchdog.clear("unknown"));

        let events = watchdog.run_cycle(&policy).await;
        assert_eq!(count(&events, EventKind::ServiceRestarted), 1);
        assert_eq!(platform.restarts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_outside_window_do_not_count() {
        let platform = Arc::new(FakePlatform::new());
        let mut watchdog = watchdog(platform.clone(), None);
        let policy = policy(&["worker"]);

        for _ in 0..6 {
            let events = watchdog.run_cycle(&policy).await;
            assert_eq!(count(&events, EventKind::ServiceFlapping), 0);
            tokio::time::advance(Duration::from_secs(120)).await;
        }
        assert_eq!(platform.restarts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_lifts_suppression() {
        let platform = Arc::new(FakePlatform::new());
        let mut watchdog = watchdog(platform.clone(), Some(600));
        let policy = policy(&["worker"]);

        for _ in 0..5 {
            watchdog.run_cycle(&policy).await;
        }
        assert_eq!(platform.restarts(), 3);

        tokio::time::advance(Duration::from_secs(601)).await;
        watchdog.run_cycle(&policy).await;
        assert_eq!(platform.restarts(), 4);
    }

    #[tokio::test]
    async fn test_removed_service_forgotten() {
        let platform = Arc::new(FakePlatform::new());
        let mut watchdog = watchdog(platform, None);

        watchdog.run_cycle(&policy(&["a", "b"])).await;
        watchdog.run_cycle(&policy(&["b"])).await;

        assert!(watchdog.service("a").is_none());
        assert_eq!(watchdog.services().count(), 1);
    }
}

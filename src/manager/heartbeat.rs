//! Shared heartbeat cycle.
//!
//! One repeating tick, at the shortest configured interval, walks every connected instance and
//! pings those whose own interval has elapsed. Pings are spawned so a slow session never holds
//! up the tick.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;

use super::state::Phase;
use super::{Inner, InstanceMap};
use crate::event::DisconnectCause;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::transport::Frame;

/// Tick period for a set of instances, `None` when no instance wants a heartbeat.
pub(super) fn period(instances: &InstanceMap) -> Option<Duration> {
    instances
        .values()
        .filter(|instance| instance.config.heartbeat_enabled())
        .map(|instance| instance.config.heartbeat_interval)
        .min()
}

pub(super) fn start(
    scheduler: &dyn Scheduler,
    period: Duration,
    manager: Weak<Inner>,
) -> TimerHandle {
    scheduler.schedule_repeating(
        period,
        Box::new(move || {
            if let Some(manager) = manager.upgrade() {
                tick(&manager);
            }
        }),
    )
}

fn tick(manager: &Arc<Inner>) {
    let now = Instant::now();

    for instance in manager.instances.values() {
        let config = &instance.config;
        if !config.heartbeat_enabled() {
            continue;
        }

        let (session, generation) = {
            let mut state = instance.lock();
            if state.phase != Phase::Connected {
                continue;
            }
            let (Some(due), Some(session)) = (state.next_heartbeat, state.session.clone())
            else {
                continue;
            };
            if now < due {
                continue;
            }

            let mut next = due + config.heartbeat_interval;
            if next <= now {
                next = now + config.heartbeat_interval;
            }
            state.next_heartbeat = Some(next);

            (session, state.generation)
        };

        let weak = Arc::downgrade(manager);
        let id = config.id.clone();
        manager.scheduler.spawn(Box::pin(async move {
            #[cfg(feature = "tracing")]
            tracing::trace!(id = %id, "Sending heartbeat");

            if let Err(e) = session.send(Frame::Ping(Vec::new())).await {
                #[cfg(feature = "tracing")]
                tracing::warn!(id = %id, error = %e, "Heartbeat send failed");

                if let Some(manager) = weak.upgrade() {
                    manager
                        .handle_disconnect(
                            &id,
                            generation,
                            DisconnectCause::HeartbeatFailed(e.to_string()),
                        )
                        .await;
                }
            }
        }));
    }
}

use anyhow::Result;
use policy_agent_enforcer::SinglePollCycle;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};


/// Drives the converger: one policy cycle and one ASG sweep immediately on
/// start, then each on its own interval. Cycle failures are logged and the
/// loop keeps ticking; the next cycle is the retry. On shutdown the in-flight
/// cycle completes before `run` returns.
pub struct PollRunner {
    cycle: Arc<SinglePollCycle>,
    policy_interval: Duration,
    asg_interval: Duration,
}

impl PollRunner {
    pub fn new(
        cycle: Arc<SinglePollCycle>,
        policy_interval: Duration,
        asg_interval: Duration,
    ) -> Self {
        Self {
            cycle,
            policy_interval,
            asg_interval,
        }
    }

    pub async fn run(self, shutdown: drain::Watch) -> Result<()> {
        let signaled = shutdown.signaled();
        tokio::pin!(signaled);

        self.policy_cycle().await;
        self.asg_cycle().await;

        let mut policy_ticks = time::interval_at(
            time::Instant::now() + self.policy_interval,
            self.policy_interval,
        );
        policy_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut asg_ticks =
            time::interval_at(time::Instant::now() + self.asg_interval, self.asg_interval);
        asg_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut signaled => {
                    info!("shutdown signaled; poll loop exiting");
                    return Ok(());
                }
                _ = policy_ticks.tick() => self.policy_cycle().await,
                _ = asg_ticks.tick() => self.asg_cycle().await,
            }
        }
    }

    // The cycles run on the blocking pool: every adapter call underneath is a
    // blocking exec.
    async fn policy_cycle(&self) {
        let cycle = self.cycle.clone();
        match tokio::task::spawn_blocking(move || cycle.do_policy_cycle()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let error = format!("{err:#}");
                error!(%error, "policy cycle failed");
            }
            Err(join_error) => error!(%join_error, "policy cycle task failed"),
        }
    }

    async fn asg_cycle(&self) {
        let cycle = self.cycle.clone();
        match tokio::task::spawn_blocking(move || cycle.do_asg_cycle()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let error = format!("{err:#}");
                error!(%error, "asg sweep failed");
            }
            Err(join_error) => error!(%join_error, "asg sweep task failed"),
        }
    }
}

use std::time::{Duration, Instant};

use crate::state::SharedState;

/// How often the scheduling pass runs. Liveness windows are multiples of
/// this, so one missed tick never flips a worker to Dead on its own.
const TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Background scheduling loop: liveness sweep, dead-worker drain, stage
/// admission and straggler speculation, all inside one lock acquisition
/// per tick.
pub async fn run(state: SharedState) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        interval.tick().await;
        state.lock().unwrap().tick(Instant::now());
    }
}

//! Timing Wheel (C5): hashed-wheel scheduler for heartbeats and timeouts.
//! Ported from `original_source/include/base/timing_wheel.hpp` — the
//! slot/lap bookkeeping and the "execute outside the lock" discipline are
//! taken directly from there; `shared_ptr<TimerNode>` becomes
//! `Arc<Mutex<TimerNode>>` so cancellation is a direct flag-set on the
//! node rather than a slot-indexed lookup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

pub type TimerTaskId = u64;
pub const INVALID_TIMER_ID: TimerTaskId = 0;

/// Prevents overflow when a delay is converted to a tick count.
pub const MAX_SAFE_DELAY_MS: i64 = i32::MAX as i64 / 1000;

type TimerTask = Box<dyn FnMut() + Send>;

struct TimerNode {
    id: TimerTaskId,
    remaining_laps: i64,
    interval_ticks: i64,
    is_periodic: bool,
    cancelled: bool,
    task: TimerTask,
}

struct State {
    current_tick: i64,
    wheel: Vec<Vec<Arc<Mutex<TimerNode>>>>,
    next_task_id: TimerTaskId,
    task_map: HashMap<TimerTaskId, Arc<Mutex<TimerNode>>>,
}

/// `slots` slots of `tick_interval_ms` each. `tick()` must be driven
/// externally (by a periodic Reactor timer) at that cadence.
pub struct TimingWheel {
    wheel_size: i64,
    tick_interval_ms: i64,
    state: Mutex<State>,
}

impl TimingWheel {
    pub fn new(wheel_size: usize, tick_interval_ms: i64) -> Self {
        Self {
            wheel_size: wheel_size as i64,
            tick_interval_ms,
            state: Mutex::new(State {
                current_tick: 0,
                wheel: (0..wheel_size).map(|_| Vec::new()).collect(),
                next_task_id: 1,
                task_map: HashMap::new(),
            }),
        }
    }

    pub fn add_task(&self, delay_ms: i64, task: impl FnMut() + Send + 'static) -> TimerTaskId {
        self.add_task_internal(delay_ms, Box::new(task), false)
    }

    pub fn add_periodic_task(&self, interval_ms: i64, task: impl FnMut() + Send + 'static) -> TimerTaskId {
        self.add_task_internal(interval_ms, Box::new(task), true)
    }

    fn add_task_internal(&self, delay_ms: i64, task: TimerTask, periodic: bool) -> TimerTaskId {
        if delay_ms <= 0 || delay_ms > MAX_SAFE_DELAY_MS {
            return INVALID_TIMER_ID;
        }

        let ticks_to_wait = (delay_ms + self.tick_interval_ms - 1) / self.tick_interval_ms;
        let mut state = self.state.lock();

        let id = state.next_task_id;
        state.next_task_id += 1;
        let remaining_laps = (ticks_to_wait - 1) / self.wheel_size;
        let target_slot = ((state.current_tick + ticks_to_wait) % self.wheel_size) as usize;

        let node = Arc::new(Mutex::new(TimerNode {
            id,
            remaining_laps,
            interval_ticks: ticks_to_wait,
            is_periodic: periodic,
            cancelled: false,
            task,
        }));
        state.wheel[target_slot].push(node.clone());
        state.task_map.insert(id, node);
        id
    }

    /// Marks the node cancelled (O(1)); actual removal happens lazily the
    /// next time its slot is scanned.
    pub fn cancel_task(&self, id: TimerTaskId) {
        if id == INVALID_TIMER_ID {
            return;
        }
        let state = self.state.lock();
        if let Some(node) = state.task_map.get(&id) {
            node.lock().cancelled = true;
        }
    }

    /// Advances the cursor one slot. Expired task callbacks run **after**
    /// this returns the lock, matching the source's deadlock avoidance.
    pub fn tick(&self) {
        let to_run = {
            let mut state = self.state.lock();
            state.current_tick = (state.current_tick + 1) % self.wheel_size;
            let current = state.current_tick as usize;

            let slot: Vec<Arc<Mutex<TimerNode>>> = state.wheel[current].drain(..).collect();
            let mut remaining = Vec::new();
            let mut expired = Vec::new();

            for node_arc in slot {
                let mut node = node_arc.lock();
                if node.cancelled {
                    state.task_map.remove(&node.id);
                    continue;
                }
                if node.remaining_laps > 0 {
                    node.remaining_laps -= 1;
                    drop(node);
                    remaining.push(node_arc);
                } else {
                    if !node.is_periodic {
                        state.task_map.remove(&node.id);
                    }
                    drop(node);
                    expired.push(node_arc);
                }
            }
            state.wheel[current] = remaining;

            for node_arc in &expired {
                let mut node = node_arc.lock();
                if node.is_periodic && !node.cancelled {
                    let target_slot = ((state.current_tick + node.interval_ticks) % self.wheel_size) as usize;
                    node.remaining_laps = (node.interval_ticks - 1) / self.wheel_size;
                    drop(node);
                    state.wheel[target_slot].push(node_arc.clone());
                }
            }

            expired
        };

        for node_arc in to_run {
            let mut node = node_arc.lock();
            if !node.cancelled {
                (node.task)();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn one_shot_task_fires_exactly_once_after_ceil_ticks() {
        let wheel = TimingWheel::new(8, 100);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        wheel.add_task(250, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        // ceil(250/100) = 3 ticks
        wheel.tick();
        wheel.tick();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        wheel.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        wheel.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_before_fire_prevents_it() {
        let wheel = TimingWheel::new(8, 100);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = wheel.add_task(100, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        wheel.cancel_task(id);
        wheel.tick();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_first_fire_stops_periodic_task() {
        let wheel = TimingWheel::new(4, 100);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = wheel.add_periodic_task(100, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        wheel.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        wheel.cancel_task(id);
        wheel.tick();
        wheel.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_delays_return_invalid_id() {
        let wheel = TimingWheel::new(8, 100);
        assert_eq!(wheel.add_task(-1, || {}), INVALID_TIMER_ID);
        assert_eq!(wheel.add_task(0, || {}), INVALID_TIMER_ID);
        assert_eq!(wheel.add_task(MAX_SAFE_DELAY_MS + 1, || {}), INVALID_TIMER_ID);
    }

    #[test]
    fn task_spanning_multiple_laps_fires_once() {
        let wheel = TimingWheel::new(4, 100);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        // 1000ms over a 4-slot/100ms wheel = 10 ticks = 2 full laps + 2 slots.
        wheel.add_task(1000, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..9 {
            wheel.tick();
            assert_eq!(count.load(Ordering::SeqCst), 0);
        }
        wheel.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

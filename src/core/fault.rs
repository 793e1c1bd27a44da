// src/core/fault.rs

//! Fault-injection knobs for the test suite and for soak runs.
//!
//! `PERIDOT_FAIL_LOC` selects the injection point by numeric id and
//! `PERIDOT_FAIL_VALUE` optionally carries a payload for it. Locations can
//! also be armed programmatically, which is what the tests do.

use parking_lot::Mutex;
use std::env;

/// Injection points checked by the service code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum FailLoc {
    /// Suppress rebuild scheduling as if it were disabled.
    RebuildDisable = 1,
    /// Fail the target connect fan-out.
    TargetConnect = 2,
    /// Fail the map broadcast after a committed membership change.
    MapBroadcast = 3,
}

#[derive(Default)]
struct FaultState {
    loaded_env: bool,
    loc: Option<u64>,
    value: u64,
    one_shot: bool,
}

static STATE: Mutex<FaultState> = Mutex::new(FaultState {
    loaded_env: false,
    loc: None,
    value: 0,
    one_shot: false,
});

fn load_env(state: &mut FaultState) {
    if state.loaded_env {
        return;
    }
    state.loaded_env = true;
    if let Ok(v) = env::var("PERIDOT_FAIL_LOC") {
        state.loc = v.parse::<u64>().ok();
    }
    if let Ok(v) = env::var("PERIDOT_FAIL_VALUE") {
        state.value = v.parse::<u64>().unwrap_or(0);
    }
}

/// Whether the given injection point is armed. One-shot locations disarm on
/// their first hit.
pub fn check(loc: FailLoc) -> bool {
    let mut state = STATE.lock();
    load_env(&mut state);
    if state.loc == Some(loc as u64) {
        if state.one_shot {
            state.loc = None;
        }
        true
    } else {
        false
    }
}

/// The payload value of the armed location.
pub fn value() -> u64 {
    let mut state = STATE.lock();
    load_env(&mut state);
    state.value
}

/// Arms an injection point. `one_shot` disarms it after the first hit.
pub fn set(loc: FailLoc, one_shot: bool) {
    let mut state = STATE.lock();
    state.loaded_env = true;
    state.loc = Some(loc as u64);
    state.one_shot = one_shot;
}

/// Disarms everything.
pub fn clear() {
    let mut state = STATE.lock();
    state.loaded_env = true;
    state.loc = None;
    state.value = 0;
    state.one_shot = false;
}

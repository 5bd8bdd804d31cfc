//! The conditioning state machine: hysteresis decisions on each reading,
//! and the fan-spin/compressor sequencing timers in between.

use fabd_protocol::hvac::Wire;
use fabd_protocol::protos::generated::fabd::HVACGoals;
use fabd_protocol::timespec::{Deadline, Stamp, Timer};
use log::{info, warn};

pub const FAN_BEFORE_COOL_MS: u64 = 10_547;
pub const FAN_AFTER_COOL_MS: u64 = 42_188;
pub const SHUTOFF_DELAY_MS: u64 = 337_500;
pub const RETRY_MS: u64 = 1_319;

pub const DEFAULT_GOAL_HIGH: i32 = 3020;
pub const DEFAULT_HYSTERESIS: i32 = 10;

/// Issues set-wire requests to whichever relay driver owns the hardware.
/// The driver may refuse any of them; refusals are retried, never escalated.
pub trait WireRequester {
    fn set_wire(&mut self, wire: Wire, connect: bool) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Off,
    Cool,
    Heat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goals {
    /// centi-Celsius; heating disabled while unset
    pub low: Option<i32>,
    /// centi-Celsius; cooling disabled while unset
    pub high: Option<i32>,
    /// symmetric dead-band, centi-Celsius
    pub hysteresis: i32,
    pub fan_always_on: bool,
}

impl Goals {
    pub fn to_pb(&self) -> HVACGoals {
        let mut pb = HVACGoals::new();
        if let Some(low) = self.low {
            pb.set_temp_low(low);
        }
        if let Some(high) = self.high {
            pb.set_temp_high(high);
        }
        pb.set_temp_hysteresis(self.hysteresis);
        pb.set_fan_always_on(self.fan_always_on);
        pb
    }
}

pub struct Controller {
    mode: Mode,
    goals: Goals,
    /// Not a timer: always set, never cleared, and survives Off->On so a
    /// restarted sequence still honours the previous shutoff.
    earliest_compressor: Stamp,
    turn_fan_on: Timer,
    turn_compressor_on: Timer,
    turn_fan_off: Timer,
}

impl Controller {
    pub fn new(goals: Goals, now: Stamp) -> Controller {
        Controller {
            mode: Mode::Off,
            goals,
            // Conservative at startup: nothing is known about the last cycle.
            earliest_compressor: now.add_ms(SHUTOFF_DELAY_MS),
            turn_fan_on: Timer::unset(),
            turn_compressor_on: Timer::unset(),
            turn_fan_off: Timer::unset(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn goals(&self) -> &Goals {
        &self.goals
    }

    #[cfg(test)]
    fn timers(&self) -> [&Timer; 3] {
        [&self.turn_fan_on, &self.turn_compressor_on, &self.turn_fan_off]
    }

    /// One weather reading, `t` in centi-Celsius.
    pub fn on_temperature(&mut self, t: i32, now: Stamp, hw: &mut dyn WireRequester) {
        info!("Temperature {}.{:02} C", t / 100, (t % 100).abs());
        let hyst = self.goals.hysteresis;
        match self.mode {
            Mode::Cool => {
                if self.goals.high.is_some_and(|high| t < high - hyst) {
                    info!("No cool needed");
                    self.stop_conditioning(now, hw);
                }
            }
            Mode::Heat => {
                if self.goals.low.is_some_and(|low| t > low + hyst) {
                    info!("No heat needed");
                    self.stop_conditioning(now, hw);
                }
            }
            Mode::Off => {
                if self.goals.high.is_some_and(|high| t > high + hyst) {
                    info!("Preparing to cool");
                    self.start_conditioning(Mode::Cool);
                } else if self.goals.low.is_some_and(|low| t < low - hyst) {
                    info!("Preparing to heat");
                    self.start_conditioning(Mode::Heat);
                }
            }
        }
    }

    fn start_conditioning(&mut self, mode: Mode) {
        self.mode = mode;
        if self.turn_fan_off.is_set() {
            // Fan wasn't turned off yet, go straight to compressor
            self.turn_compressor_on.set(self.earliest_compressor);
            self.turn_fan_off.clear();
        } else {
            self.turn_fan_on.set(self.earliest_compressor);
        }
    }

    fn stop_conditioning(&mut self, now: Stamp, hw: &mut dyn WireRequester) {
        if self.turn_fan_on.is_set() {
            // Fan hasn't turned on yet, just cancel it
            self.turn_fan_on.clear();
            self.mode = Mode::Off;
        } else if self.turn_compressor_on.is_set() {
            // Compressor hasn't turned on yet, just stop fan
            self.turn_compressor_on.clear();
            self.turn_fan_off.set(now);
            self.mode = Mode::Off;
        } else {
            info!("Turning off compressor");
            let mut success = true;
            success &= hw.set_wire(Wire::Y1, false);
            success &= hw.set_wire(Wire::Ob, false);
            if !success {
                warn!("Failed to turn off compressor");
            } else {
                self.mode = Mode::Off;
                self.turn_fan_off
                    .set(Stamp::now().add_ms(FAN_AFTER_COOL_MS));
            }
            self.earliest_compressor = now.add_ms(SHUTOFF_DELAY_MS);
        }
    }

    /// Service every pending timer, in fan-on, compressor-on, fan-off order.
    /// Failures back the affected action off by the retry interval via
    /// `deadline` without disturbing the timer itself.
    pub fn run_timers(&mut self, now: Stamp, hw: &mut dyn WireRequester, deadline: &mut Deadline) {
        if self.turn_fan_on.passed(now, deadline) {
            info!("Turning on  fan");
            if hw.set_wire(Wire::G, true) {
                self.turn_fan_on.clear();
                self.turn_compressor_on.set(now.add_ms(FAN_BEFORE_COOL_MS));
            } else {
                warn!("FAILED to turn on fan");
                deadline.lower(now.add_ms(RETRY_MS));
            }
        }
        if self.turn_compressor_on.passed(now, deadline) {
            info!("Turning on  compressor");
            let reversing = self.mode == Mode::Cool;
            let mut success = true;
            success &= hw.set_wire(Wire::Ob, reversing);
            success &= hw.set_wire(Wire::Y1, true);
            if success {
                self.turn_compressor_on.clear();
            } else {
                warn!("FAILED to turn on compressor");
                hw.set_wire(Wire::Y1, false);
                hw.set_wire(Wire::Ob, false);
                deadline.lower(now.add_ms(RETRY_MS));
            }
        }
        if self.turn_fan_off.passed(now, deadline) {
            if self.goals.fan_always_on {
                self.turn_fan_off.clear();
            } else {
                info!("Turning off fan");
                self.earliest_compressor = now.add_ms(SHUTOFF_DELAY_MS);
                if hw.set_wire(Wire::G, false) {
                    self.turn_fan_off.clear();
                } else {
                    warn!("FAILED to turn off fan");
                    deadline.lower(now.add_ms(RETRY_MS));
                }
            }
        }
    }

    /// Apply a goals update. Returns true if anything changed; a violating
    /// update is refused whole.
    pub fn apply_goals(&mut self, update: &HVACGoals, hw: &mut dyn WireRequester) -> bool {
        let mut next = self.goals.clone();
        if update.has_temp_low() {
            next.low = Some(update.temp_low());
        }
        if update.has_temp_high() {
            next.high = Some(update.temp_high());
        }
        if update.has_temp_hysteresis() {
            next.hysteresis = update.temp_hysteresis();
        }
        if update.has_fan_always_on() {
            next.fan_always_on = update.fan_always_on();
        }

        if next.hysteresis < 0 {
            warn!("Rejecting goals: negative hysteresis");
            return false;
        }
        if let (Some(low), Some(high)) = (next.low, next.high) {
            if low + next.hysteresis > high - next.hysteresis {
                warn!(
                    "Rejecting goals: dead-bands overlap (low {} high {} hysteresis {})",
                    low, high, next.hysteresis
                );
                return false;
            }
        }

        let fan_forced_on = next.fan_always_on && !self.goals.fan_always_on;
        let changed = next != self.goals;
        self.goals = next;

        if fan_forced_on {
            self.turn_fan_off.clear();
            if !hw.set_wire(Wire::G, true) {
                warn!("Failed to engage fan for fan-always-on");
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockHw {
        calls: Vec<(Wire, bool)>,
        fail: bool,
    }

    impl MockHw {
        fn new() -> MockHw {
            MockHw {
                calls: Vec::new(),
                fail: false,
            }
        }
    }

    impl WireRequester for MockHw {
        fn set_wire(&mut self, wire: Wire, connect: bool) -> bool {
            self.calls.push((wire, connect));
            !self.fail
        }
    }

    fn goals() -> Goals {
        Goals {
            low: Some(2400),
            high: Some(3020),
            hysteresis: 50,
            fan_always_on: false,
        }
    }

    fn set_timer_count(c: &Controller) -> usize {
        c.timers().iter().filter(|t| t.is_set()).count()
    }

    #[test]
    fn cold_start_cool_sequences_fan_then_compressor() {
        let t0 = Stamp::new(100, 0);
        let mut hw = MockHw::new();
        let mut c = Controller::new(goals(), t0);

        c.on_temperature(3100, t0, &mut hw);
        assert_eq!(c.mode(), Mode::Cool);
        assert!(hw.calls.is_empty());
        assert_eq!(c.turn_fan_on.at(), Some(t0.add_ms(SHUTOFF_DELAY_MS)));
        assert_eq!(set_timer_count(&c), 1);

        // Nothing fires before the startup lockout elapses.
        let mut dl = Deadline::unset();
        c.run_timers(t0.add_ms(1000), &mut hw, &mut dl);
        assert!(hw.calls.is_empty());
        assert_eq!(dl.to_poll_ms(t0.add_ms(1000)), (SHUTOFF_DELAY_MS - 1000) as i64);

        // Lockout over: fan first.
        let t1 = t0.add_ms(SHUTOFF_DELAY_MS + 1);
        let mut dl = Deadline::unset();
        c.run_timers(t1, &mut hw, &mut dl);
        assert_eq!(hw.calls, vec![(Wire::G, true)]);
        assert_eq!(c.turn_compressor_on.at(), Some(t1.add_ms(FAN_BEFORE_COOL_MS)));
        assert_eq!(set_timer_count(&c), 1);

        // Pre-spin over: reversing then compressor.
        let t2 = t1.add_ms(FAN_BEFORE_COOL_MS + 1);
        let mut dl = Deadline::unset();
        c.run_timers(t2, &mut hw, &mut dl);
        assert_eq!(
            hw.calls,
            vec![(Wire::G, true), (Wire::Ob, true), (Wire::Y1, true)]
        );
        assert_eq!(set_timer_count(&c), 0);

        // Steady state: nothing more without a new reading.
        let mut dl = Deadline::unset();
        c.run_timers(t2.add_ms(60_000), &mut hw, &mut dl);
        assert_eq!(hw.calls.len(), 3);
        assert_eq!(dl.to_poll_ms(t2.add_ms(60_000)), -1);
    }

    #[test]
    fn heat_uses_reversing_off() {
        let t0 = Stamp::new(100, 0);
        let mut hw = MockHw::new();
        let mut c = Controller::new(goals(), t0);

        c.on_temperature(2300, t0, &mut hw);
        assert_eq!(c.mode(), Mode::Heat);

        let t1 = t0.add_ms(SHUTOFF_DELAY_MS + 1);
        c.run_timers(t1, &mut hw, &mut Deadline::unset());
        let t2 = t1.add_ms(FAN_BEFORE_COOL_MS + 1);
        c.run_timers(t2, &mut hw, &mut Deadline::unset());
        assert_eq!(
            hw.calls,
            vec![(Wire::G, true), (Wire::Ob, false), (Wire::Y1, true)]
        );
    }

    #[test]
    fn no_requests_inside_dead_band() {
        let t0 = Stamp::new(100, 0);
        let mut hw = MockHw::new();
        let mut c = Controller::new(goals(), t0);

        for t in [2450, 2700, 2970] {
            c.on_temperature(t, t0, &mut hw);
            let far = t0.add_ms(SHUTOFF_DELAY_MS * 2);
            c.run_timers(far, &mut hw, &mut Deadline::unset());
        }
        assert_eq!(c.mode(), Mode::Off);
        assert!(hw.calls.is_empty());
        assert_eq!(set_timer_count(&c), 0);
    }

    #[test]
    fn cancel_before_fan_is_silent() {
        let t0 = Stamp::new(100, 0);
        let mut hw = MockHw::new();
        let mut c = Controller::new(goals(), t0);

        c.on_temperature(3100, t0, &mut hw);
        c.on_temperature(2900, t0.add_ms(30_000), &mut hw);
        assert_eq!(c.mode(), Mode::Off);
        assert!(hw.calls.is_empty());
        assert_eq!(set_timer_count(&c), 0);
    }

    #[test]
    fn cancel_after_fan_schedules_immediate_fan_off() {
        let t0 = Stamp::new(100, 0);
        let mut hw = MockHw::new();
        let mut c = Controller::new(goals(), t0);

        c.on_temperature(3100, t0, &mut hw);
        let t1 = t0.add_ms(SHUTOFF_DELAY_MS + 1);
        c.run_timers(t1, &mut hw, &mut Deadline::unset());
        assert_eq!(hw.calls, vec![(Wire::G, true)]);

        // Cooled off before the compressor ever started.
        let t2 = t1.add_ms(2_000);
        c.on_temperature(2900, t2, &mut hw);
        assert_eq!(c.mode(), Mode::Off);
        assert!(c.turn_fan_off.is_set());
        assert_eq!(set_timer_count(&c), 1);

        c.run_timers(t2.add_ms(1), &mut hw, &mut Deadline::unset());
        assert_eq!(hw.calls, vec![(Wire::G, true), (Wire::G, false)]);
        assert_eq!(set_timer_count(&c), 0);
    }

    #[test]
    fn running_stop_turns_off_compressor_and_spins_fan_down() {
        let t0 = Stamp::new(100, 0);
        let mut hw = MockHw::new();
        let mut c = Controller::new(goals(), t0);

        c.on_temperature(3100, t0, &mut hw);
        let t1 = t0.add_ms(SHUTOFF_DELAY_MS + 1);
        c.run_timers(t1, &mut hw, &mut Deadline::unset());
        let t2 = t1.add_ms(FAN_BEFORE_COOL_MS + 1);
        c.run_timers(t2, &mut hw, &mut Deadline::unset());
        hw.calls.clear();

        let t3 = t2.add_ms(120_000);
        c.on_temperature(2900, t3, &mut hw);
        assert_eq!(hw.calls, vec![(Wire::Y1, false), (Wire::Ob, false)]);
        assert_eq!(c.mode(), Mode::Off);
        assert!(c.turn_fan_off.is_set());
        assert_eq!(c.earliest_compressor, t3.add_ms(SHUTOFF_DELAY_MS));

        // An immediate re-demand goes straight to the compressor timer and
        // honours the fresh lockout.
        c.on_temperature(3100, t3.add_ms(5_000), &mut hw);
        assert_eq!(c.mode(), Mode::Cool);
        assert!(!c.turn_fan_off.is_set());
        assert_eq!(c.turn_compressor_on.at(), Some(t3.add_ms(SHUTOFF_DELAY_MS)));
        assert_eq!(set_timer_count(&c), 1);
    }

    #[test]
    fn failed_stop_keeps_cooling_and_retries_on_next_reading() {
        let t0 = Stamp::new(100, 0);
        let mut hw = MockHw::new();
        let mut c = Controller::new(goals(), t0);

        c.on_temperature(3100, t0, &mut hw);
        let t1 = t0.add_ms(SHUTOFF_DELAY_MS + 1);
        c.run_timers(t1, &mut hw, &mut Deadline::unset());
        let t2 = t1.add_ms(FAN_BEFORE_COOL_MS + 1);
        c.run_timers(t2, &mut hw, &mut Deadline::unset());
        hw.calls.clear();

        hw.fail = true;
        let t3 = t2.add_ms(120_000);
        c.on_temperature(2900, t3, &mut hw);
        assert_eq!(c.mode(), Mode::Cool);
        assert!(!c.turn_fan_off.is_set());

        hw.fail = false;
        c.on_temperature(2900, t3.add_ms(10_000), &mut hw);
        assert_eq!(c.mode(), Mode::Off);
    }

    #[test]
    fn fan_on_failure_backs_off_retry_interval() {
        let t0 = Stamp::new(100, 0);
        let mut hw = MockHw::new();
        let mut c = Controller::new(goals(), t0);

        c.on_temperature(3100, t0, &mut hw);
        hw.fail = true;
        let t1 = t0.add_ms(SHUTOFF_DELAY_MS + 1);
        let mut dl = Deadline::unset();
        c.run_timers(t1, &mut hw, &mut dl);
        assert!(c.turn_fan_on.is_set());
        assert_eq!(dl.to_poll_ms(t1), RETRY_MS as i64);

        // Retry succeeds.
        hw.fail = false;
        c.run_timers(t1.add_ms(RETRY_MS + 1), &mut hw, &mut Deadline::unset());
        assert!(!c.turn_fan_on.is_set());
        assert!(c.turn_compressor_on.is_set());
    }

    #[test]
    fn compressor_failure_unwinds_both_wires() {
        let t0 = Stamp::new(100, 0);
        let mut hw = MockHw::new();
        let mut c = Controller::new(goals(), t0);

        c.on_temperature(3100, t0, &mut hw);
        let t1 = t0.add_ms(SHUTOFF_DELAY_MS + 1);
        c.run_timers(t1, &mut hw, &mut Deadline::unset());
        hw.calls.clear();

        hw.fail = true;
        let t2 = t1.add_ms(FAN_BEFORE_COOL_MS + 1);
        let mut dl = Deadline::unset();
        c.run_timers(t2, &mut hw, &mut dl);
        assert_eq!(
            hw.calls,
            vec![
                (Wire::Ob, true),
                (Wire::Y1, true),
                (Wire::Y1, false),
                (Wire::Ob, false)
            ]
        );
        assert!(c.turn_compressor_on.is_set());
        assert_eq!(dl.to_poll_ms(t2), RETRY_MS as i64);
    }

    #[test]
    fn fan_always_on_skips_fan_off() {
        // Anchored to the real clock: the post-stop fan-off deadline is
        // stamped from a fresh clock read inside the stop path.
        let t0 = Stamp::now();
        let mut hw = MockHw::new();
        let mut c = Controller::new(
            Goals {
                fan_always_on: true,
                ..goals()
            },
            t0,
        );

        c.on_temperature(3100, t0, &mut hw);
        let t1 = t0.add_ms(SHUTOFF_DELAY_MS + 1);
        c.run_timers(t1, &mut hw, &mut Deadline::unset());
        let t2 = t1.add_ms(FAN_BEFORE_COOL_MS + 1);
        c.run_timers(t2, &mut hw, &mut Deadline::unset());
        hw.calls.clear();

        let t3 = t2.add_ms(120_000);
        c.on_temperature(2900, t3, &mut hw);
        assert!(c.turn_fan_off.is_set());
        let before = c.earliest_compressor;

        // The pending fan-off is absorbed without a G request and without
        // touching the compressor lockout again.
        let t4 = t3.add_ms(60_000);
        hw.calls.clear();
        c.run_timers(t4, &mut hw, &mut Deadline::unset());
        assert!(!c.turn_fan_off.is_set());
        assert!(hw.calls.is_empty());
        assert_eq!(c.earliest_compressor, before);
    }

    #[test]
    fn goals_update_validates_dead_bands() {
        let t0 = Stamp::new(100, 0);
        let mut hw = MockHw::new();
        let mut c = Controller::new(goals(), t0);

        let mut bad = HVACGoals::new();
        bad.set_temp_low(3000);
        bad.set_temp_high(3010);
        assert!(!c.apply_goals(&bad, &mut hw));
        assert_eq!(c.goals(), &goals());

        let mut good = HVACGoals::new();
        good.set_temp_low(2000);
        assert!(c.apply_goals(&good, &mut hw));
        assert_eq!(c.goals().low, Some(2000));
        assert_eq!(c.goals().high, Some(3020));

        // Same values again: no change to announce.
        assert!(!c.apply_goals(&good, &mut hw));
    }

    #[test]
    fn enabling_fan_always_on_engages_fan_and_clears_pending_off() {
        let t0 = Stamp::new(100, 0);
        let mut hw = MockHw::new();
        let mut c = Controller::new(goals(), t0);
        c.turn_fan_off.set(t0.add_ms(10_000));

        let mut update = HVACGoals::new();
        update.set_fan_always_on(true);
        assert!(c.apply_goals(&update, &mut hw));
        assert!(!c.turn_fan_off.is_set());
        assert_eq!(hw.calls, vec![(Wire::G, true)]);

        // Turning it back off takes no immediate action.
        hw.calls.clear();
        let mut update = HVACGoals::new();
        update.set_fan_always_on(false);
        assert!(c.apply_goals(&update, &mut hw));
        assert!(hw.calls.is_empty());
        assert!(!c.turn_fan_off.is_set());
    }

    /// A relay driver plus a crude thermal model: the room leaks toward a
    /// hot outside and the compressor pulls it down. The driver half also
    /// asserts the sequencing contract on every request it accepts.
    struct SimPlant {
        room_t: f64,
        outside_t: f64,
        fan: bool,
        compressor: bool,
        reversing: bool,
        now: Stamp,
        last_compressor_off: Stamp,
        compressor_starts: u32,
    }

    impl SimPlant {
        fn new(room_t: f64, outside_t: f64, t0: Stamp) -> SimPlant {
            SimPlant {
                room_t,
                outside_t,
                fan: false,
                compressor: false,
                reversing: false,
                now: t0,
                last_compressor_off: t0,
                compressor_starts: 0,
            }
        }

        /// One minute of physics.
        fn step(&mut self) {
            self.room_t += (self.outside_t - self.room_t) * 0.01;
            if self.compressor {
                self.room_t -= 0.15;
            }
        }

        fn reading(&self) -> i32 {
            (self.room_t * 100.0).round() as i32
        }
    }

    impl WireRequester for SimPlant {
        fn set_wire(&mut self, wire: Wire, connect: bool) -> bool {
            match wire {
                Wire::G => {
                    assert!(connect || !self.compressor, "fan off under compressor");
                    self.fan = connect;
                }
                Wire::Y1 => {
                    if connect {
                        assert!(self.fan, "compressor without fan pre-spin");
                        if !self.compressor {
                            let idle = self.now.since(self.last_compressor_off);
                            assert!(
                                idle.as_millis() as u64 >= SHUTOFF_DELAY_MS,
                                "short cycle: {} ms idle",
                                idle.as_millis()
                            );
                            self.compressor_starts += 1;
                        }
                    } else if self.compressor {
                        self.last_compressor_off = self.now;
                    }
                    self.compressor = connect;
                }
                Wire::Ob => {
                    assert!(
                        connect == self.reversing || !self.compressor,
                        "reversing flipped under load"
                    );
                    self.reversing = connect;
                }
                other => panic!("unexpected wire {:?}", other),
            }
            true
        }
    }

    #[test]
    fn simulated_hot_day_holds_the_band() {
        // Real-clock anchored: the stop path stamps its fan-off deadline
        // from a fresh clock read.
        let t0 = Stamp::now();
        let mut plant = SimPlant::new(31.0, 35.0, t0);
        let mut c = Controller::new(goals(), t0);

        let mut now = t0;
        for minute in 0..300 {
            now = now.add_ms(60_000);
            plant.now = now;
            plant.step();

            c.run_timers(now, &mut plant, &mut Deadline::unset());
            c.on_temperature(plant.reading(), now, &mut plant);

            // Past the startup lockout and first pull-down, the band holds.
            if minute > 30 {
                assert!(
                    (29.0..=31.1).contains(&plant.room_t),
                    "minute {}: room at {:.2}",
                    minute,
                    plant.room_t
                );
            }
        }

        assert!(
            plant.compressor_starts >= 3,
            "only {} compressor cycles in 5 h",
            plant.compressor_starts
        );
        assert!(set_timer_count(&c) <= 1);
    }

    #[test]
    fn goals_pb_roundtrip() {
        let g = goals();
        let pb = g.to_pb();
        assert_eq!(pb.temp_low(), 2400);
        assert_eq!(pb.temp_high(), 3020);
        assert_eq!(pb.temp_hysteresis(), 50);
        assert!(!pb.fan_always_on());
    }
}

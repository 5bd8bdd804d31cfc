//! HVAC wire identities, per-wire relay state, and the interlocks both relay
//! drivers enforce before touching hardware.

use std::time::Duration;

use log::warn;

use crate::protos::generated::fabd::HVACWires;
use crate::timespec::Stamp;

/// Observed position of a relay. `Unknown` until the first confirmed change
/// after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tristate {
    Off,
    On,
    Unknown,
}

impl From<bool> for Tristate {
    fn from(connect: bool) -> Tristate {
        if connect {
            Tristate::On
        } else {
            Tristate::Off
        }
    }
}

impl Tristate {
    pub fn from_byte(b: u8) -> Tristate {
        match b {
            0 => Tristate::Off,
            1 => Tristate::On,
            _ => Tristate::Unknown,
        }
    }
}

/// HVAC control lines, numbered as the backplate numbers its FETs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Wire {
    W1 = 0,
    Y1 = 1,
    G = 2,
    Ob = 3,
    W2 = 4,
    Y2 = 7,
    C = 8,
    Rc = 9,
    Star = 11,
}

/// Size of the backplate's FET bank; indices past the named wires exist on
/// the wire but have no policy.
pub const WIRE_SLOTS: usize = 13;

pub const ALL_WIRES: [Wire; 9] = [
    Wire::W1,
    Wire::Y1,
    Wire::G,
    Wire::Ob,
    Wire::W2,
    Wire::Y2,
    Wire::C,
    Wire::Rc,
    Wire::Star,
];

impl Wire {
    pub fn from_index(i: usize) -> Option<Wire> {
        ALL_WIRES.iter().copied().find(|w| w.index() == i)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Wire::Y1 => "compressor (Y1)",
            Wire::Y2 => "cool 2 (Y2)",
            Wire::W1 => "heat (W1)",
            Wire::W2 => "heat 2 (W2)",
            Wire::G => "fan (G)",
            Wire::Ob => "reversing (OB)",
            Wire::Star => "aux",
            Wire::C => "common (C)",
            Wire::Rc => "Rc",
        }
    }

    pub fn from_pb(wire: HVACWires) -> Wire {
        match wire {
            HVACWires::W1 => Wire::W1,
            HVACWires::Y1 => Wire::Y1,
            HVACWires::G => Wire::G,
            HVACWires::OB => Wire::Ob,
            HVACWires::W2 => Wire::W2,
            HVACWires::Y2 => Wire::Y2,
            HVACWires::C => Wire::C,
            HVACWires::RC => Wire::Rc,
            HVACWires::Star => Wire::Star,
        }
    }

    pub fn to_pb(self) -> HVACWires {
        match self {
            Wire::W1 => HVACWires::W1,
            Wire::Y1 => HVACWires::Y1,
            Wire::G => HVACWires::G,
            Wire::Ob => HVACWires::OB,
            Wire::W2 => HVACWires::W2,
            Wire::Y2 => HVACWires::Y2,
            Wire::C => HVACWires::C,
            Wire::Rc => HVACWires::RC,
            Wire::Star => HVACWires::Star,
        }
    }
}

/// Minimum interval between a compressor stage going off and re-engaging.
pub const SHUTOFF_DELAY: Duration = Duration::from_millis(337_500);

/// A reversing change this close after compressor turn-on is assumed to be
/// the other half of a near-simultaneous request pair and is let through.
pub const REVERSING_TOLERANCE: Duration = Duration::from_secs(1);

/// Tracked state of one wire.
#[derive(Debug, Clone, Copy)]
pub struct RelayState {
    pub value: Tristate,
    pub last_change: Stamp,
    pub min_cycle: Duration,
    pub present: Tristate,
}

impl RelayState {
    /// `last_change` starts at `now`: lockouts apply from process start, so
    /// the very first compressor request waits out the full delay.
    pub fn new(now: Stamp) -> RelayState {
        RelayState {
            value: Tristate::Unknown,
            last_change: now,
            min_cycle: SHUTOFF_DELAY,
            present: Tristate::Unknown,
        }
    }
}

/// What a relay driver exposes to the shared interlocks.
pub trait WirePlant {
    fn state(&self, wire: Wire) -> &RelayState;

    /// Whether this driver can actuate the wire at all.
    fn controllable(&self, wire: Wire) -> bool;

    /// Actuate with no policy checks. Implementations update their tracked
    /// state and publish the wire-change event.
    fn apply_unsafe(&mut self, wire: Wire, connect: bool, now: Stamp) -> bool;
}

/// Fan pre-engagement for the compressor/heat-2 path. G-on has no refusal
/// conditions of its own, so this goes straight to the hardware; the
/// interlocks never recurse deeper than this.
fn ensure_fan<P: WirePlant + ?Sized>(plant: &mut P, now: Stamp) -> bool {
    plant.apply_unsafe(Wire::G, true, now)
}

/// Apply `connect` to `wire` if the interlocks allow it. Refusals are logged
/// at WARNING and reported as `false`; they are never fatal.
pub fn set_wire_safe<P: WirePlant + ?Sized>(
    plant: &mut P,
    wire: Wire,
    connect: bool,
    now: Stamp,
) -> bool {
    match wire {
        Wire::Y1 | Wire::W2 => {
            if connect && plant.state(wire).value != Tristate::On {
                let st = plant.state(wire);
                // after turning off, lock off for a few minutes
                if now < st.last_change.add(st.min_cycle) {
                    warn!(
                        "Prevented attempt to turn on {} during safety lockout",
                        wire.name()
                    );
                    return false;
                }
                if plant.controllable(Wire::G) && plant.state(Wire::G).value != Tristate::On {
                    if !ensure_fan(plant, now) {
                        warn!(
                            "Failed to force fan on during request to turn on {}",
                            wire.name()
                        );
                        return false;
                    }
                }
            }
        }
        Wire::Ob => {
            // Never under compressor load. If somebody tries anyway, shut the
            // compressor off: it is working against what they evidently want.
            let compressor = plant.state(Wire::Y1);
            if compressor.value != Tristate::Off && Tristate::from(connect) != plant.state(wire).value
            {
                if now > compressor.last_change.add(REVERSING_TOLERANCE) {
                    warn!(
                        "Prevented attempt to turn {} reversing while compressor running",
                        onoff(connect)
                    );
                    set_wire_safe(plant, Wire::Y1, false, now);
                    return false;
                }
            }
        }
        Wire::G => {
            if !connect {
                if plant.state(Wire::Y1).value != Tristate::Off {
                    warn!("Prevented attempt to turn off fan while compressor running");
                    return false;
                }
                if plant.controllable(Wire::W2) && plant.state(Wire::W2).value != Tristate::Off {
                    warn!("Prevented attempt to turn off fan while heat 2 running");
                    return false;
                }
            }
        }
        _ => {
            // No enumerated policy means no safety controls; refuse.
            warn!(
                "Prevented attempt to turn {} unmanaged wire {}",
                onoff(connect),
                wire.name()
            );
            return false;
        }
    }
    plant.apply_unsafe(wire, connect, now)
}

pub fn onoff(connect: bool) -> &'static str {
    if connect {
        "on"
    } else {
        "off"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockPlant {
        states: [RelayState; WIRE_SLOTS],
        fitted: Vec<Wire>,
        applied: Vec<(Wire, bool)>,
        fail_apply: bool,
    }

    impl MockPlant {
        fn new(now: Stamp, fitted: &[Wire]) -> MockPlant {
            MockPlant {
                states: [RelayState::new(now); WIRE_SLOTS],
                fitted: fitted.to_vec(),
                applied: Vec::new(),
                fail_apply: false,
            }
        }

        fn force(&mut self, wire: Wire, value: Tristate, last_change: Stamp) {
            self.states[wire.index()].value = value;
            self.states[wire.index()].last_change = last_change;
        }
    }

    impl WirePlant for MockPlant {
        fn state(&self, wire: Wire) -> &RelayState {
            &self.states[wire.index()]
        }

        fn controllable(&self, wire: Wire) -> bool {
            self.fitted.contains(&wire)
        }

        fn apply_unsafe(&mut self, wire: Wire, connect: bool, now: Stamp) -> bool {
            if self.fail_apply {
                return false;
            }
            self.applied.push((wire, connect));
            let st = &mut self.states[wire.index()];
            if st.value != Tristate::from(connect) {
                st.last_change = now;
            }
            st.value = connect.into();
            true
        }
    }

    const FULL: &[Wire] = &[Wire::Y1, Wire::G, Wire::Ob, Wire::W2];

    #[test]
    fn compressor_locked_out_after_recent_shutoff() {
        let t0 = Stamp::new(1000, 0);
        let mut plant = MockPlant::new(t0, FULL);
        plant.force(Wire::Y1, Tristate::Off, t0);
        plant.force(Wire::G, Tristate::On, t0);

        // 100 s after shutoff: refused, nothing actuated.
        assert!(!set_wire_safe(&mut plant, Wire::Y1, true, t0.add_ms(100_000)));
        assert!(plant.applied.is_empty());
        assert_eq!(plant.state(Wire::Y1).value, Tristate::Off);

        // 340 s after shutoff: allowed.
        assert!(set_wire_safe(&mut plant, Wire::Y1, true, t0.add_ms(340_000)));
        assert_eq!(plant.applied, vec![(Wire::Y1, true)]);
        assert_eq!(plant.state(Wire::Y1).value, Tristate::On);
    }

    #[test]
    fn compressor_on_forces_fan_first() {
        let t0 = Stamp::new(1000, 0);
        let later = t0.add_ms(400_000);
        let mut plant = MockPlant::new(t0, FULL);
        plant.force(Wire::Y1, Tristate::Off, t0);
        plant.force(Wire::G, Tristate::Off, t0);

        assert!(set_wire_safe(&mut plant, Wire::Y1, true, later));
        assert_eq!(plant.applied, vec![(Wire::G, true), (Wire::Y1, true)]);
    }

    #[test]
    fn compressor_on_refused_when_fan_fails() {
        let t0 = Stamp::new(1000, 0);
        let later = t0.add_ms(400_000);
        let mut plant = MockPlant::new(t0, FULL);
        plant.force(Wire::Y1, Tristate::Off, t0);
        plant.force(Wire::G, Tristate::Off, t0);
        plant.fail_apply = true;

        assert!(!set_wire_safe(&mut plant, Wire::Y1, true, later));
        assert_eq!(plant.state(Wire::Y1).value, Tristate::Off);
    }

    #[test]
    fn fan_not_required_when_absent() {
        let t0 = Stamp::new(1000, 0);
        let later = t0.add_ms(400_000);
        let mut plant = MockPlant::new(t0, &[Wire::Y1, Wire::Ob]);
        plant.force(Wire::Y1, Tristate::Off, t0);

        assert!(set_wire_safe(&mut plant, Wire::Y1, true, later));
        assert_eq!(plant.applied, vec![(Wire::Y1, true)]);
    }

    #[test]
    fn fan_off_refused_while_compressor_on() {
        let t0 = Stamp::new(1000, 0);
        let mut plant = MockPlant::new(t0, FULL);
        plant.force(Wire::Y1, Tristate::On, t0);
        plant.force(Wire::G, Tristate::On, t0);

        assert!(!set_wire_safe(&mut plant, Wire::G, false, t0.add_ms(5_000)));
        assert_eq!(plant.state(Wire::G).value, Tristate::On);
    }

    #[test]
    fn fan_off_refused_while_heat2_on() {
        let t0 = Stamp::new(1000, 0);
        let mut plant = MockPlant::new(t0, FULL);
        plant.force(Wire::Y1, Tristate::Off, t0);
        plant.force(Wire::W2, Tristate::On, t0);
        plant.force(Wire::G, Tristate::On, t0);

        assert!(!set_wire_safe(&mut plant, Wire::G, false, t0.add_ms(5_000)));
    }

    #[test]
    fn fan_off_allowed_when_idle() {
        let t0 = Stamp::new(1000, 0);
        let mut plant = MockPlant::new(t0, FULL);
        plant.force(Wire::Y1, Tristate::Off, t0);
        plant.force(Wire::W2, Tristate::Off, t0);
        plant.force(Wire::G, Tristate::On, t0);

        assert!(set_wire_safe(&mut plant, Wire::G, false, t0.add_ms(5_000)));
        assert_eq!(plant.state(Wire::G).value, Tristate::Off);
    }

    #[test]
    fn reversing_locked_under_load_and_compressor_killed() {
        let t0 = Stamp::new(1000, 0);
        let mut plant = MockPlant::new(t0, FULL);
        plant.force(Wire::Y1, Tristate::On, t0);
        plant.force(Wire::Ob, Tristate::Off, t0);
        plant.force(Wire::G, Tristate::On, t0);

        // 5 s after compressor turn-on: refused, corrective Y1-off issued.
        assert!(!set_wire_safe(&mut plant, Wire::Ob, true, t0.add_ms(5_000)));
        assert_eq!(plant.applied, vec![(Wire::Y1, false)]);
        assert_eq!(plant.state(Wire::Ob).value, Tristate::Off);
        assert_eq!(plant.state(Wire::Y1).value, Tristate::Off);
    }

    #[test]
    fn reversing_allowed_within_tolerance_of_turn_on() {
        let t0 = Stamp::new(1000, 0);
        let mut plant = MockPlant::new(t0, FULL);
        plant.force(Wire::Y1, Tristate::On, t0);
        plant.force(Wire::Ob, Tristate::Off, t0);

        // 0.5 s after compressor turn-on: the pair arrived together.
        assert!(set_wire_safe(&mut plant, Wire::Ob, true, t0.add_ms(500)));
        assert_eq!(plant.applied, vec![(Wire::Ob, true)]);
    }

    #[test]
    fn reversing_same_value_is_noop_under_load() {
        let t0 = Stamp::new(1000, 0);
        let mut plant = MockPlant::new(t0, FULL);
        plant.force(Wire::Y1, Tristate::On, t0);
        plant.force(Wire::Ob, Tristate::On, t0);

        assert!(set_wire_safe(&mut plant, Wire::Ob, true, t0.add_ms(5_000)));
        assert_eq!(plant.applied, vec![(Wire::Ob, true)]);
        assert_eq!(plant.state(Wire::Y1).value, Tristate::On);
    }

    #[test]
    fn unmanaged_wires_always_refused() {
        let t0 = Stamp::new(1000, 0);
        for wire in [Wire::W1, Wire::Y2, Wire::C, Wire::Rc, Wire::Star] {
            let mut plant = MockPlant::new(t0, &[wire]);
            assert!(!set_wire_safe(&mut plant, wire, true, t0.add_ms(400_000)));
            assert!(!set_wire_safe(&mut plant, wire, false, t0.add_ms(400_000)));
            assert!(plant.applied.is_empty());
        }
    }

    #[test]
    fn wire_pb_roundtrip() {
        for wire in ALL_WIRES {
            assert_eq!(Wire::from_pb(wire.to_pb()), wire);
            assert_eq!(Wire::from_index(wire.index()), Some(wire));
        }
        assert_eq!(Wire::from_index(5), None);
        assert_eq!(Wire::from_index(12), None);
    }
}

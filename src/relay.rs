//! Relay bank access behind the [`RelayPort`] trait. The `gpio` feature
//! gates the real MCP23017 driver; without it, a mock bank tracks output
//! state in memory for development and tests.
//!
//! All irrigation writes are required to flow through the interlocked
//! actuator; nothing else in the rig holds a relay handle directly.

use std::collections::HashMap;
use std::fmt;

use crate::error::RigError;

// ---------------------------------------------------------------------------
// Named outputs
// ---------------------------------------------------------------------------

/// A named boolean output on the relay bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayOutput {
    /// Main irrigation pump.
    Pump,
    /// Per-zone irrigation valve.
    Zone(u8),
    /// Hand-gun hose outlet.
    HandGun,
    /// Tank block valve.
    TankBlock(u8),
}

impl fmt::Display for RelayOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pump => write!(f, "pump"),
            Self::Zone(n) => write!(f, "zone{n}"),
            Self::HandGun => write!(f, "hand_gun"),
            Self::TankBlock(n) => write!(f, "tank_block{n}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Port trait
// ---------------------------------------------------------------------------

pub trait RelayPort: Send {
    /// Drive a single output. A failed write means the relay bus state is
    /// suspect; callers are expected to escalate to `emergency_stop`.
    fn set(&mut self, output: RelayOutput, on: bool) -> Result<(), RigError>;

    fn get(&self, output: RelayOutput) -> bool;

    fn all_off(&mut self) -> Result<(), RigError>;

    /// Force every output to its safe default. Best-effort: must not fail,
    /// must leave whatever it can reach switched off.
    fn emergency_stop(&mut self);
}

// ---------------------------------------------------------------------------
// Mock bank (development and tests, no hardware)
// ---------------------------------------------------------------------------

pub struct MockRelayBank {
    outputs: HashMap<RelayOutput, bool>,
    /// Outputs whose next write should fail, for failure-injection tests.
    fail_on: Vec<RelayOutput>,
    /// When set, every write past this many successful ones fails.
    fail_after: Option<usize>,
    writes: usize,
}

impl MockRelayBank {
    pub fn new(outputs: &[RelayOutput]) -> Self {
        let outputs = outputs.iter().map(|o| (*o, false)).collect();
        Self {
            outputs,
            fail_on: Vec::new(),
            fail_after: None,
            writes: 0,
        }
    }

    /// Standard rig layout: pump, hand-gun, `zones` zone valves, two tank
    /// block valves.
    pub fn with_zones(zones: u8) -> Self {
        let mut outputs = vec![RelayOutput::Pump, RelayOutput::HandGun];
        outputs.extend((1..=zones).map(RelayOutput::Zone));
        outputs.extend((1..=2).map(RelayOutput::TankBlock));
        Self::new(&outputs)
    }

    /// Make every subsequent write to `output` fail.
    pub fn fail_writes_to(&mut self, output: RelayOutput) {
        self.fail_on.push(output);
    }

    /// Let the first `n` writes succeed, then fail every later one. Lets a
    /// test fault the bus mid-sequence rather than on a fixed output.
    pub fn fail_after_writes(&mut self, n: usize) {
        self.fail_after = Some(n);
    }
}

impl RelayPort for MockRelayBank {
    fn set(&mut self, output: RelayOutput, on: bool) -> Result<(), RigError> {
        if self.fail_on.contains(&output) {
            return Err(RigError::RelayWrite(format!(
                "injected write failure on {output}"
            )));
        }
        if self.fail_after.is_some_and(|limit| self.writes >= limit) {
            return Err(RigError::RelayWrite(format!(
                "injected write failure on {output} (budget spent)"
            )));
        }
        match self.outputs.get_mut(&output) {
            Some(state) => {
                *state = on;
                self.writes += 1;
                tracing::debug!(%output, on, "mock relay write");
                Ok(())
            }
            None => Err(RigError::RelayWrite(format!("unknown output {output}"))),
        }
    }

    fn get(&self, output: RelayOutput) -> bool {
        self.outputs.get(&output).copied().unwrap_or(false)
    }

    fn all_off(&mut self) -> Result<(), RigError> {
        let keys: Vec<RelayOutput> = self.outputs.keys().copied().collect();
        for k in keys {
            self.set(k, false)?;
        }
        Ok(())
    }

    fn emergency_stop(&mut self) {
        // Bypasses injected failures: the safe default must always win.
        for state in self.outputs.values_mut() {
            *state = false;
        }
        tracing::warn!("mock relay bank: emergency stop, all outputs off");
    }
}

// ---------------------------------------------------------------------------
// MCP23017 bank (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub use mcp::Mcp23017RelayBank;

#[cfg(feature = "gpio")]
mod mcp {
    use super::{RelayOutput, RelayPort, RigError};
    use rppal::i2c::I2c;
    use std::collections::HashMap;

    const IODIRA: u8 = 0x00;
    const IODIRB: u8 = 0x01;
    const OLATA: u8 = 0x14;
    const OLATB: u8 = 0x15;

    /// Relay bank over one or more MCP23017 GPIO expanders. Output latch
    /// state is shadowed locally so writes are single-register.
    pub struct Mcp23017RelayBank {
        i2c: I2c,
        // output -> (expander address, pin 0..=15)
        map: HashMap<RelayOutput, (u8, u8)>,
        // address -> shadowed 16-bit output latch
        latches: HashMap<u8, u16>,
    }

    impl Mcp23017RelayBank {
        pub fn new(map: &[(RelayOutput, u8, u8)]) -> Result<Self, RigError> {
            let mut i2c = I2c::new().map_err(|e| RigError::RelayWrite(e.to_string()))?;
            let mut latches = HashMap::new();

            for &(_, addr, _) in map {
                if latches.contains_key(&addr) {
                    continue;
                }
                // All pins outputs, all off. Fail-safe default at startup.
                i2c.set_slave_address(addr as u16)
                    .map_err(|e| RigError::RelayWrite(e.to_string()))?;
                for (reg, val) in [(IODIRA, 0x00), (IODIRB, 0x00), (OLATA, 0x00), (OLATB, 0x00)]
                {
                    i2c.smbus_write_byte(reg, val)
                        .map_err(|e| RigError::RelayWrite(e.to_string()))?;
                }
                latches.insert(addr, 0);
            }

            Ok(Self {
                i2c,
                map: map.iter().map(|&(o, a, p)| (o, (a, p))).collect(),
                latches,
            })
        }

        fn write_latch(&mut self, addr: u8, latch: u16) -> Result<(), RigError> {
            self.i2c
                .set_slave_address(addr as u16)
                .map_err(|e| RigError::RelayWrite(e.to_string()))?;
            self.i2c
                .smbus_write_byte(OLATA, (latch & 0xff) as u8)
                .map_err(|e| RigError::RelayWrite(e.to_string()))?;
            self.i2c
                .smbus_write_byte(OLATB, (latch >> 8) as u8)
                .map_err(|e| RigError::RelayWrite(e.to_string()))?;
            self.latches.insert(addr, latch);
            Ok(())
        }
    }

    impl RelayPort for Mcp23017RelayBank {
        fn set(&mut self, output: RelayOutput, on: bool) -> Result<(), RigError> {
            let (addr, pin) = *self
                .map
                .get(&output)
                .ok_or_else(|| RigError::RelayWrite(format!("unknown output {output}")))?;
            let latch = self.latches.get(&addr).copied().unwrap_or(0);
            let latch = if on {
                latch | (1 << pin)
            } else {
                latch & !(1 << pin)
            };
            self.write_latch(addr, latch)?;
            tracing::debug!(%output, on, addr, pin, "relay write");
            Ok(())
        }

        fn get(&self, output: RelayOutput) -> bool {
            match self.map.get(&output) {
                Some(&(addr, pin)) => {
                    let latch = self.latches.get(&addr).copied().unwrap_or(0);
                    latch & (1 << pin) != 0
                }
                None => false,
            }
        }

        fn all_off(&mut self) -> Result<(), RigError> {
            let addrs: Vec<u8> = self.latches.keys().copied().collect();
            for addr in addrs {
                self.write_latch(addr, 0)?;
            }
            Ok(())
        }

        fn emergency_stop(&mut self) {
            let addrs: Vec<u8> = self.latches.keys().copied().collect();
            for addr in addrs {
                if let Err(e) = self.write_latch(addr, 0) {
                    tracing::error!(addr, "emergency stop: latch clear failed: {e}");
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

use anyhow::Result;
use std::fmt::Display;

use crate::session::Session;

/// Device families that publish one scaled quantity per holding register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorKind {
    Temperature,
    Pressure,
}

impl SensorKind {
    // raw register counts per physical unit
    pub fn divisor(self) -> f32 {
        match self {
            SensorKind::Temperature => 10.0,
            SensorKind::Pressure => 100.0,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            SensorKind::Temperature => "°C",
            SensorKind::Pressure => "bar",
        }
    }

    // digits the raw resolution supports
    pub fn decimals(self) -> usize {
        match self {
            SensorKind::Temperature => 1,
            SensorKind::Pressure => 2,
        }
    }
}

impl Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorKind::Temperature => "temperature".fmt(f),
            SensorKind::Pressure => "pressure".fmt(f),
        }
    }
}

/// Read one holding register and scale it to the sensor's physical unit.
pub fn read_sensor(session: &mut Session, kind: SensorKind, address: u16) -> Result<f32> {
    let raw = session.read_register(address)?;
    Ok(f32::from(raw) / kind.divisor())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::SimulatedTransport;

    fn connected(registers: &[(u16, u16)]) -> Session {
        let mut session = Session::new("sim", 9600, 1);
        session.connect_with(Box::new(SimulatedTransport::with_registers(
            1,
            registers.iter().copied(),
        )));
        session
    }

    #[test]
    fn temperature_scales_by_tenths() {
        let mut session = connected(&[(0x0064, 250)]);

        let value = read_sensor(&mut session, SensorKind::Temperature, 0x0064).unwrap();
        assert!((value - 25.0).abs() < 1e-4);
    }

    #[test]
    fn pressure_scales_by_hundredths() {
        let mut session = connected(&[(0x0064, 1234)]);

        let value = read_sensor(&mut session, SensorKind::Pressure, 0x0064).unwrap();
        assert!((value - 12.34).abs() < 1e-4);
    }
}

//! Source dipole: a position and oriented direction at a solution point.

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Dipole {
    pub position: (f32, f32, f32),
    pub direction: (f32, f32, f32),
    pub solution_point_index: i32,
    pub power: f64,
    pub frequency_hz: f64,
    pub phase_rad: f64,
}

impl Dipole {
    pub fn new(position: (f32, f32, f32)) -> Self {
        Self {
            position,
            direction: (0.0, 0.0, 0.0),
            solution_point_index: -1,
            power: 0.0,
            frequency_hz: 0.0,
            phase_rad: 0.0,
        }
    }

    /// Points the dipole's direction toward `electrode_pos`, normalized.
    pub fn set_direction(&mut self, electrode_pos: (f32, f32, f32)) {
        let d = (
            electrode_pos.0 - self.position.0,
            electrode_pos.1 - self.position.1,
            electrode_pos.2 - self.position.2,
        );
        let norm = (d.0 * d.0 + d.1 * d.1 + d.2 * d.2).sqrt();
        self.direction = if norm > 0.0 {
            (d.0 / norm, d.1 / norm, d.2 / norm)
        } else {
            (0.0, 0.0, 0.0)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_is_normalized() {
        let mut d = Dipole::new((0.0, 0.0, 0.0));
        d.set_direction((3.0, 4.0, 0.0));
        let (x, y, z) = d.direction;
        assert!(((x * x + y * y + z * z).sqrt() - 1.0).abs() < 1e-6);
    }
}

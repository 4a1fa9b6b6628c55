use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

// Duty returned by a curve without points
pub const DEFAULT_DUTY: u8 = 50;

// A single (temperature, duty) pair of a fan curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "CurvePointRecord")]
pub struct CurvePoint {
    pub temperature: f32,
    pub duty: u8,
}

impl CurvePoint {
    // Create a new curve point,
    // automatically clamp the given duty between 0 and 100
    pub fn new(temperature: f32, duty: i32) -> Self {
        Self {
            temperature,
            duty: duty.clamp(0, 100) as u8,
        }
    }
}

impl From<(f32, i32)> for CurvePoint {
    fn from(value: (f32, i32)) -> Self {
        Self::new(value.0, value.1)
    }
}

impl fmt::Display for CurvePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°C → {}%", self.temperature, self.duty)
    }
}

// Points read from disk are not trusted,
// the duty goes through the same clamping as `CurvePoint::new`
#[derive(Deserialize)]
struct CurvePointRecord {
    temperature: f32,
    duty: i64,
}

impl From<CurvePointRecord> for CurvePoint {
    fn from(record: CurvePointRecord) -> Self {
        Self::new(record.temperature, record.duty.clamp(0, 100) as i32)
    }
}

// Points are sorted once at construction, the curve is immutable afterwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CurveRecord")]
pub struct Curve {
    name: String,
    points: Vec<CurvePoint>,
}

#[derive(Deserialize)]
struct CurveRecord {
    name: String,
    #[serde(default)]
    points: Vec<CurvePoint>,
}

impl From<CurveRecord> for Curve {
    fn from(record: CurveRecord) -> Self {
        Self::new(&record.name, record.points)
    }
}

impl Curve {
    pub fn new(name: &str, points: impl IntoIterator<Item = CurvePoint>) -> Self {
        let mut points: Vec<CurvePoint> = points
            .into_iter()
            .filter(|p| {
                if p.temperature.is_finite() {
                    true
                } else {
                    warn!("Dropping non finite point from curve \"{name}\"");
                    false
                }
            })
            .collect();

        // Stable sort, points sharing a temperature keep their order
        points.sort_by(|a, b| a.temperature.total_cmp(&b.temperature));

        Self {
            name: name.to_string(),
            points,
        }
    }

    // Build a curve from plain (temperature, duty) pairs
    pub fn from_pairs(name: &str, pairs: &[(f32, u8)]) -> Self {
        Self::new(
            name,
            pairs.iter().map(|(t, d)| CurvePoint::new(*t, *d as i32)),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    // Return the fan duty for the given temperature
    pub fn evaluate(&self, temperature: f32) -> u8 {
        let (Some(first), Some(last)) = (self.points.first(), self.points.last())
        else {
            return DEFAULT_DUTY;
        };

        // An unreadable temperature gets the hottest duty
        if temperature.is_nan() {
            return last.duty;
        }

        // The first point holds up to and including its temperature,
        // even when later points share it
        if temperature <= first.temperature {
            return first.duty;
        }

        if temperature >= last.temperature {
            return last.duty;
        }

        // Every point before `idx` is at or below the temperature and
        // the point at `idx` is strictly above it. The bounds checks above
        // guarantee 0 < idx < len.
        let idx = self.points.partition_point(|p| p.temperature <= temperature);
        let pre = &self.points[idx - 1];
        let suc = &self.points[idx];

        // Exactly on a point: no interpolation. When several points share
        // this temperature the later one wins.
        if pre.temperature == temperature {
            return pre.duty;
        }

        linear_interpolation(pre, suc, temperature)
    }
}

// Perform the linear interpolation between
// two points and return the fan duty truncated toward zero
fn linear_interpolation(pre: &CurvePoint, suc: &CurvePoint, temp: f32) -> u8 {
    let x1 = pre.temperature;
    let y1 = pre.duty as f32;
    let x2 = suc.temperature;
    let y2 = suc.duty as f32;

    let ratio = (temp - x1) / (x2 - x1);

    ((y1 + ratio * (y2 - y1)) as i32).clamp(0, 100) as u8
}

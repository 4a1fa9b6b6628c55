// Saved presets depend on these tables, don't edit them

use crate::fan_curve::Curve;

pub const SILENT: &str = "Silent";
pub const BALANCED: &str = "Balanced";
pub const PERFORMANCE: &str = "Performance";
pub const AGGRESSIVE: &str = "Aggressive";

pub const SILENT_POINTS: [(f32, u8); 8] = [
    (0., 30),
    (50., 35),
    (60., 40),
    (70., 50),
    (75., 60),
    (80., 75),
    (85., 90),
    (90., 100),
];

pub const BALANCED_POINTS: [(f32, u8); 8] = [
    (0., 35),
    (50., 40),
    (60., 50),
    (70., 65),
    (75., 75),
    (80., 85),
    (85., 95),
    (90., 100),
];

pub const PERFORMANCE_POINTS: [(f32, u8); 8] = [
    (0., 40),
    (50., 50),
    (60., 60),
    (70., 75),
    (75., 85),
    (80., 95),
    (85., 100),
    (90., 100),
];

pub const AGGRESSIVE_POINTS: [(f32, u8); 8] = [
    (0., 50),
    (50., 60),
    (60., 70),
    (70., 85),
    (75., 95),
    (80., 100),
    (85., 100),
    (90., 100),
];

pub fn silent() -> Curve {
    Curve::from_pairs(SILENT, &SILENT_POINTS)
}

pub fn balanced() -> Curve {
    Curve::from_pairs(BALANCED, &BALANCED_POINTS)
}

pub fn performance() -> Curve {
    Curve::from_pairs(PERFORMANCE, &PERFORMANCE_POINTS)
}

pub fn aggressive() -> Curve {
    Curve::from_pairs(AGGRESSIVE, &AGGRESSIVE_POINTS)
}

// All the built-in presets, from the quietest to the loudest
pub fn all() -> Vec<Curve> {
    vec![silent(), balanced(), performance(), aggressive()]
}

// Look up a built-in preset, ignoring case
pub fn by_name(name: &str) -> Option<Curve> {
    all()
        .into_iter()
        .find(|c| c.name().eq_ignore_ascii_case(name.trim()))
}

/// Virtual clock and run pacing.
pub mod clock;
/// Controller interface and the hysteresis baseline.
pub mod controller;
pub mod engine;
pub mod kpi;
/// Finite-horizon solvers behind the `HorizonOptimizer` seam.
pub mod optimizer;
pub mod predictive;
pub mod sensor;
/// Lumped-parameter RC thermal model.
pub mod thermal;
pub mod types;

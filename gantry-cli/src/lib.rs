//! Gantry process entry points and runtime glue.

pub mod alerts;
pub mod bars;
pub mod control;
pub mod shutdown;
pub mod supervisor;
pub mod telemetry;
pub mod trading;

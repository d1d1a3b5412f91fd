//! MILP dispatch planning for storage and flexible devices behind a grid
//! connection.
//!
//! A [`flex::ScheduleRequest`] is translated into a
//! [`optimizer::SchedulingProblem`] (devices, commitments, site bounds),
//! which the [`optimizer::OptimizationDriver`] turns into a mixed-integer
//! program, solves, verifies and maps back to a [`domain::Schedule`].

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod flex;
pub mod optimizer;
pub mod telemetry;

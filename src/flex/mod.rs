//! Business-facing inputs and their translation into scheduling problems.

pub mod flex_context;
pub mod flex_model;
pub mod process;
pub mod translator;

pub use flex_context::{FlexContext, InflexibleDevice, RawCommitment};
pub use flex_model::{FlexModel, ProcessFlexModel, StorageFlexModel, TimeWindow};
pub use process::{OptimizationDirection, ProcessSpec, ProcessType};
pub use translator::{translate, DeviceRequest, ScheduleRequest, TranslatorSettings};

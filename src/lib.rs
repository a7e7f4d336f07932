//! # testexec
//!
//! The shared core of a factory-floor production-test executive: a sequence
//! engine that routes sensor readings through measurements and limits, a
//! family of UUT console protocols, a serial port with record/replay
//! simulation, and device programmers that report like any measurement.
//!
//! ## Quick Start
//!
//! ```rust
//! use testexec::config::BenchConfig;
//! use testexec::engine::{Context, Engine, Sequence, StepError, TestProgram};
//! use testexec::safety::SafetyManager;
//!
//! struct Smoke {
//!     sequence: Sequence,
//! }
//!
//! impl TestProgram for Smoke {
//!     fn name(&self) -> &str {
//!         "smoke"
//!     }
//!     fn sequence(&mut self) -> &mut Sequence {
//!         &mut self.sequence
//!     }
//!     fn open(&mut self, _ctx: &mut Context) -> Result<(), StepError> {
//!         Ok(())
//!     }
//!     fn safety(&mut self, _ctx: &mut Context, _safety: &mut SafetyManager) {}
//! }
//!
//! let mut program = Smoke {
//!     sequence: Sequence::new().step("Nothing", |_ctx| Ok(())),
//! };
//! let mut engine = Engine::new(BenchConfig::fifo());
//! let results = engine.execute(&mut program, &[1]).unwrap();
//! assert!(results[0].passed());
//! ```
//!
//! ## Architecture
//!
//! - [`serial`] - byte streams, real and simulated
//! - [`console`] - dialect codecs, parameter tables, CAN tunnel
//! - [`programmer`] - ISP-LPC, nRF, AVR UPDI, PIC and J-Link backends
//! - [`sensors`], [`limits`], [`measurement`] - the reading model
//! - [`engine`] - steps, sequences, context and the run loop
//! - [`safety`] - teardown bookkeeping
//! - [`signals`] - the `TestRun.*` event bus

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]

pub mod config;
pub mod console;
pub mod engine;
pub mod limits;
pub mod measurement;
pub mod programmer;
pub mod results;
pub mod safety;
pub mod sensors;
pub mod serial;
pub mod signals;
pub mod timing;

// Re-export main public types for convenience
pub use config::BenchConfig;
pub use console::{Console, ConsoleError, Dialect, Parameter, ParameterTable};
pub use engine::{Context, Engine, Sequence, StepError, TestProgram};
pub use limits::Limit;
pub use measurement::{Measurement, MeasurementResult, Verdict};
pub use results::{ResultCode, UutResult};
pub use serial::{ByteStream, SimSerial};

//! Core value types for weft.
//!
//! Everything here is plain data shared by the effect runtime and its
//! callers:
//!
//! | Type | Role |
//! |------|------|
//! | [`Outcome`] | Terminal state of a run (success / failure / defect / interrupted) |
//! | [`Exit`], [`Cause`] | Outcome folded into a `Result` |
//! | [`Defect`] | Unrecoverable failure with its original cause |
//! | [`AttributeValue`] | Scalar span attribute |
//! | [`Rng`], [`SeededRng`], [`EntropyRng`] | Injected randomness |

mod attribute;
mod defect;
mod outcome;
mod rng;

pub use attribute::{attributes, AttributeValue, Attributes};
pub use defect::{Defect, DefectKind, DefectSource};
pub use outcome::{Cause, Exit, Outcome};
pub use rng::{EntropyRng, Rng, SeededRng};

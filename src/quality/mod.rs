//! Post-implementation verification: command gates and the judge.

pub mod gates;
pub mod judge;

pub use gates::{
    GateProgressState, GateProgressUpdate, GateResult, GateStatus, QualityGateRunner,
    QualityReport,
};
pub use judge::{parse_verdict, JudgeVerdict, Verdict};

pub mod analysis_gate;

pub use analysis_gate::AnalysisGate;

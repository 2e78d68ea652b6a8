pub mod analyst;
pub mod collector;
pub mod context;
pub mod decision;
pub mod dispatcher;
pub mod pipeline;
pub mod publisher;
pub mod scorer;

pub use analyst::MarketAnalyst;
pub use collector::MarketDataCollector;
pub use dispatcher::{SignalDispatcher, SubmitOutcome, WorkerPool};
pub use pipeline::MarketAnalyzer;
pub use publisher::SignalPublisher;
pub use scorer::SignalScorer;

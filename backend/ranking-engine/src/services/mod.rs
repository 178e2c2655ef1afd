pub mod artifacts;
pub mod diversity;
pub mod ranking;
pub mod recall;
pub mod rules;
pub mod scoring;
pub mod signal_store;
pub mod similar;
pub mod tags;

pub use artifacts::ArtifactLoader;
pub use diversity::DiversityLayer;
pub use ranking::Engine;
pub use recall::RecallLayer;
pub use rules::{JsonRulesStore, RulesManager};
pub use signal_store::ArtifactAlgoStore;
pub use similar::SimilarItemsEngine;
pub use tags::{FileTagStore, InMemoryTagStore};

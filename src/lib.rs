//! tarifdoc — Swiss ambulatory tariff decision engine.
//!
//! Given a free-text encounter description plus optional structured inputs
//! (ICD codes, medications, age, sex, laterality, procedure count), the
//! engine decides whether the encounter bills as a flat-rate package
//! (Pauschale) or as individual TARDOC services, and explains which
//! conditions held or failed.

pub mod billing;
pub mod catalog;
pub mod config;
pub mod context;
pub mod demographics;
pub mod engine;
pub mod error;
pub mod i18n;
pub mod llm;
pub mod pauschale;
pub mod retrieval;
pub mod rules;
pub mod server;

pub use engine::{AnalyzeRequest, AnalyzeResponse, Engine};
pub use error::{Result, TarifError};

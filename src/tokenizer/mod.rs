//! Text analysis for full-text fields.

#[allow(clippy::module_inception)]
mod tokenizer;

pub use tokenizer::Tokenizer;

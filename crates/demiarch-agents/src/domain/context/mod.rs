//! Context with progressive disclosure (index → timeline → full)
//!
//! History items are stored once with a cheap Index summary. Retrieval hands
//! each execution a token-bounded bundle, upgrading only the most relevant
//! items to richer layers.

mod bundle;
mod embedding;
mod error;
mod injection;
mod item;
mod retriever;
mod store;
mod summarize;
mod tokenizer;

pub use self::{
    bundle::*, embedding::*, error::*, injection::*, item::*, retriever::*, store::*,
    summarize::*, tokenizer::*,
};

//! Semantic matching of free-text food descriptions.
//!
//! Given an input column and a target reference column, food-mapper embeds
//! both with `thenlper/gte-large` (1024 dimensions), scores every input
//! against every target by cosine similarity, and reports the best target
//! per input row together with a threshold decision.
//!
//! Embeddings come from an OpenAI-compatible remote service by default. When
//! that service keeps failing, the run switches to a local ONNX Runtime copy
//! of the same model and every vector in the result is produced locally, so a
//! single run never mixes backends.
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`embedding`]: Remote and local embedding backends
//! - [`error`]: Error types for configuration, providers and runs
//! - [`matching`]: Fallback coordination, batching, similarity and the run entry point
//! - [`text`]: Text normalization applied before embedding
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use food_mapper::config::FoodMapperConfig;
//! use food_mapper::embedding::LocalModel;
//! use food_mapper::matching::{MatchEngine, RunConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = FoodMapperConfig::load()?;
//! let local = Arc::new(LocalModel::from_config(&config.embedding));
//! let engine = MatchEngine::from_config(&config, Arc::clone(&local))?;
//!
//! let inputs = vec!["Chicken breast, raw".to_string()];
//! let targets = vec!["Chicken, broilers or fryers, breast, meat only, raw".to_string()];
//! let outcome = engine.run(&inputs, &targets, &RunConfig::from_config(&config)).await?;
//! println!("{:?}", outcome.results[0]);
//! local.dispose();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod matching;
pub mod text;

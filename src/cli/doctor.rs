//! CLI `doctor` command: print the resolved configuration and backend readiness.

use anyhow::Result;

use food_mapper::config::{expand_tilde, FoodMapperConfig};
use food_mapper::embedding::local::{model_paths, ComputeDevice};
use food_mapper::matching::{FallbackMode, RunConfig};

/// Report which embedding backends a run with this configuration could use.
pub fn doctor(config: &FoodMapperConfig) -> Result<()> {
    let cache_dir = expand_tilde(&config.embedding.cache_dir);
    let (model_path, tokenizer_path) = model_paths(&cache_dir);
    let has_key = !config.remote.api_key.trim().is_empty();
    let local_ready = model_path.exists() && tokenizer_path.exists();
    let mode = config.matching.fallback_mode;

    println!("food-mapper Health Report");
    println!("=========================");
    println!();
    println!("Remote embedding service:");
    println!("  Base URL:        {}", config.remote.base_url);
    println!("  Model:           {}", config.remote.model);
    println!("  API key:         {}", if has_key { "present" } else { "missing" });
    println!("  Timeout:         {}s", config.remote.timeout_secs);
    println!("  Priority tier:   {}", if config.remote.priority { "on" } else { "off" });
    println!();
    println!("Local model:");
    println!("  Model:           {}", config.embedding.model);
    println!("  Dimensions:      {}", config.embedding.dimensions);
    println!("  ONNX file:       {}", status_of(&model_path));
    println!("  Tokenizer:       {}", status_of(&tokenizer_path));
    println!("  Device:          {}", ComputeDevice::preferred().as_str());
    println!();
    println!("Matching:");
    println!("  Fallback mode:   {mode}");
    println!("  Threshold:       {}", config.matching.threshold);
    println!("  Batch size:      {}", config.matching.batch_size);
    println!("  Concurrency:     {}", config.matching.concurrency);
    println!("  Max retries:     {}", config.matching.max_retries);

    if let Err(e) = RunConfig::from_config(config).validate() {
        println!();
        println!("  WARNING: {e}");
    }

    let problems = readiness_problems(mode, has_key, local_ready);
    println!();
    if problems.is_empty() {
        println!("Status:            OK");
    } else {
        println!("Status:            NOT READY");
        for problem in problems {
            println!("  - {problem}");
        }
    }

    Ok(())
}

fn status_of(path: &std::path::Path) -> String {
    if path.exists() {
        format!("{} (found)", path.display())
    } else {
        format!("{} (missing)", path.display())
    }
}

fn readiness_problems(mode: FallbackMode, has_key: bool, local_ready: bool) -> Vec<&'static str> {
    let mut problems = Vec::new();
    if mode.uses_remote() && !has_key {
        problems.push("no API key: set DEEPINFRA_API_KEY or switch MODEL_FALLBACK_MODE to local");
    }
    if mode.uses_local() && !local_ready {
        problems.push("local model files missing: run `food-mapper model download`");
    }
    problems
}

//! Built-in operation handlers.
//!
//! These are the integration seams for the external numeric kernels: each
//! handler validates its parameters, reserves output space in the tensor
//! region and returns handles describing where the kernel's results land.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use shared::tensor::{DType, Params, TensorHandle, Value};

use crate::arena::Arena;
use crate::executor::{ExecOutput, Executor, ExecutorRegistry, OpError};
use crate::sandbox;

/// Register every built-in operation. Call order is the capability order
/// and is deliberately explicit; no import-time side effects.
pub fn register_builtin(registry: &mut ExecutorRegistry) {
    registry.register("loader.checkpoint", || Box::new(CheckpointLoader));
    registry.register("encoder.clip_text", || Box::new(ClipTextEncode));
    registry.register("sampler.diffusion", || Box::new(DiffusionSampler));
    registry.register("decoder.vae", || Box::new(VaeDecode));
}

fn require_str<'p>(params: &'p Params, name: &str) -> Result<&'p str, OpError> {
    params
        .get(name)
        .ok_or_else(|| OpError::MissingParam(name.to_string()))?
        .as_str()
        .ok_or_else(|| OpError::InvalidParam {
            name: name.to_string(),
            reason: "expected a string".to_string(),
        })
}

fn int_or(params: &Params, name: &str, default: i64) -> Result<i64, OpError> {
    match params.get(name) {
        None => Ok(default),
        Some(value) => value.as_i64().ok_or_else(|| OpError::InvalidParam {
            name: name.to_string(),
            reason: "expected an integer".to_string(),
        }),
    }
}

fn alloc_output(arena: &Arena, dtype: DType, shape: &[u64]) -> Result<TensorHandle, OpError> {
    let size_bytes = shape.iter().product::<u64>() * dtype.size_bytes();
    let offset = arena.alloc(size_bytes)?;
    Ok(TensorHandle { offset, size_bytes, dtype, shape: shape.to_vec() })
}

/// Loads a model checkpoint and hands out references for its components.
/// The catalog lookup and weight loading live in an external collaborator;
/// this stub reserves the component descriptors.
struct CheckpointLoader;

impl Executor for CheckpointLoader {
    fn execute(
        &mut self,
        arena: &Arena,
        _inputs: &HashMap<String, TensorHandle>,
        params: &Params,
    ) -> Result<ExecOutput, OpError> {
        let checkpoint = require_str(params, "checkpoint")?;
        debug!(checkpoint, "loading checkpoint");

        let mut outputs = HashMap::new();
        outputs.insert("model".to_string(), alloc_output(arena, DType::F16, &[1])?);
        outputs.insert("clip".to_string(), alloc_output(arena, DType::F16, &[1])?);
        outputs.insert("vae".to_string(), alloc_output(arena, DType::F16, &[1])?);
        Ok(ExecOutput { outputs, items_processed: None })
    }
}

/// Encodes a text prompt into conditioning embeddings.
struct ClipTextEncode;

impl Executor for ClipTextEncode {
    fn execute(
        &mut self,
        arena: &Arena,
        _inputs: &HashMap<String, TensorHandle>,
        params: &Params,
    ) -> Result<ExecOutput, OpError> {
        let text = require_str(params, "text")?;
        let tokens = text.split_whitespace().count() as u64;
        debug!(tokens, "encoding prompt");

        let mut outputs = HashMap::new();
        outputs.insert(
            "conditioning".to_string(),
            alloc_output(arena, DType::F16, &[1, 77, 768])?,
        );
        Ok(ExecOutput { outputs, items_processed: Some(tokens) })
    }
}

/// Runs the diffusion sampling loop over a latent.
struct DiffusionSampler;

impl Executor for DiffusionSampler {
    fn execute(
        &mut self,
        arena: &Arena,
        _inputs: &HashMap<String, TensorHandle>,
        params: &Params,
    ) -> Result<ExecOutput, OpError> {
        let steps = int_or(params, "steps", 20)?;
        if steps < 1 {
            return Err(OpError::InvalidParam {
                name: "steps".to_string(),
                reason: format!("must be at least 1, got {steps}"),
            });
        }
        let cfg = params.get("cfg").and_then(Value::as_f64).unwrap_or(7.0);
        let sampler = params.get("sampler").and_then(Value::as_str).unwrap_or("euler");
        debug!(steps, cfg, sampler, "sampling");

        let mut outputs = HashMap::new();
        outputs.insert("samples".to_string(), alloc_output(arena, DType::F16, &[1, 4, 64, 64])?);
        Ok(ExecOutput { outputs, items_processed: Some(steps as u64) })
    }
}

/// Decodes latent samples into an image.
struct VaeDecode;

impl Executor for VaeDecode {
    fn execute(
        &mut self,
        arena: &Arena,
        inputs: &HashMap<String, TensorHandle>,
        params: &Params,
    ) -> Result<ExecOutput, OpError> {
        let samples = inputs
            .get("samples")
            .ok_or_else(|| OpError::MissingInput("samples".to_string()))?;
        // save_path is written by the decode kernel and must pass the write policy.
        if let Some(save_path) = params.get("save_path").and_then(Value::as_str) {
            sandbox::check_write(Path::new(save_path))?;
        }
        debug!(elements = samples.element_count(), "decoding latents");

        let mut outputs = HashMap::new();
        outputs.insert("image".to_string(), alloc_output(arena, DType::U8, &[1, 512, 512, 3])?);
        Ok(ExecOutput { outputs, items_processed: None })
    }
}

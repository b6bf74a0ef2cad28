//! Binary checkpoint loading.
//!
//! The stream is little-endian:
//!
//! ```text
//! u32 magic
//! i32 embedding_dim, max_sequence_len, n_heads, n_layers, n_vocab, ftype
//! n_vocab x { u32 len, len bytes utf8, f32 score }
//! repeated until EOF:
//!   { i32 n_dims, i32 name_len, i32 type_tag, n_dims x i32 extents, name, payload }
//! ```
//!
//! Every tensor is planned up front from the hyperparameters and carved out
//! of a single [`WeightArena`]. Records are checked against their slot
//! before any payload byte is copied.
//!
//! # Example
//!
//! ```ignore
//! use ember_core::model::Checkpoint;
//!
//! let checkpoint = Checkpoint::load("/path/to/model.bin")?;
//! println!("{} layers", checkpoint.model.hparams().n_layers);
//! ```

use super::config::{byte_footprint, dtype_from_tag};
use super::{
    Attention, DecoderLayer, GeluMlp, Hyperparameters, LayerNorm, Model, ModelMetadata, Tokenizer,
    LAYER_NORM_EPS,
};
use crate::error::{EmberError, Result};
use candle_core::quantized::{ggml_file, GgmlDType, QMatMul, QTensor};
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Checkpoint magic, "ggml".
pub const MAGIC: u32 = 0x6767_6d6c;

/// Bookkeeping bytes reserved per tensor in the arena.
pub const TENSOR_OVERHEAD: usize = 512;

/// Alignment of each tensor slot inside the arena.
pub const SLOT_ALIGN: usize = 32;

/// Longest tensor name accepted.
const MAX_NAME_LEN: usize = 1024;

/// Name of the token embedding table.
pub const TOKEN_EMBEDDING: &str = "transformer.wte.weight";

/// Name of the final norm scale.
pub const FINAL_NORM: &str = "transformer.norm_f.weight";

/// Per-block tensor roles, in canonical order.
pub const BLOCK_ROLES: [&str; 6] = [
    "norm_1.weight",
    "attn.Wqkv.weight",
    "attn.out_proj.weight",
    "norm_2.weight",
    "ffn.up_proj.weight",
    "ffn.down_proj.weight",
];

/// Canonical name of a per-block tensor.
pub fn block_tensor_name(layer: usize, role: &str) -> String {
    format!("transformer.blocks.{layer}.{role}")
}

/// Declared layout of one tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSpec {
    /// Canonical name.
    pub name: String,
    /// Element type.
    pub dtype: GgmlDType,
    /// Extents, innermost first; unused trailing extents are 1.
    pub ne: [usize; 2],
    /// Number of meaningful extents.
    pub n_dims: usize,
}

impl TensorSpec {
    fn new(name: String, dtype: GgmlDType, ne: [usize; 2], n_dims: usize) -> Self {
        Self {
            name,
            dtype,
            ne,
            n_dims,
        }
    }

    /// Number of elements, `None` on overflow.
    pub fn n_elements(&self) -> Option<usize> {
        self.ne[0].checked_mul(self.ne[1])
    }

    /// Byte footprint, `None` if the row is not a whole number of blocks or
    /// the size overflows.
    pub fn n_bytes(&self) -> Option<usize> {
        byte_footprint(self.dtype, self.n_elements()?)
    }

    /// Row-major dims as the backend expects them.
    fn dims(&self) -> Vec<usize> {
        if self.n_dims == 1 {
            vec![self.ne[0]]
        } else {
            vec![self.ne[1], self.ne[0]]
        }
    }
}

/// Every tensor the model expects, in canonical order.
pub fn planned_tensors(hparams: &Hyperparameters) -> Vec<TensorSpec> {
    let d = hparams.embedding_dim;
    let wtype = hparams.float_encoding.weight_dtype();
    let norm = |name: String| TensorSpec::new(name, GgmlDType::F32, [d, 1], 1);

    let mut specs = Vec::with_capacity(2 + 6 * hparams.n_layers);
    specs.push(TensorSpec::new(
        TOKEN_EMBEDDING.to_string(),
        wtype,
        [d, hparams.n_vocab],
        2,
    ));
    specs.push(norm(FINAL_NORM.to_string()));

    for il in 0..hparams.n_layers {
        let name = |role| block_tensor_name(il, role);
        specs.push(norm(name(BLOCK_ROLES[0])));
        specs.push(TensorSpec::new(name(BLOCK_ROLES[1]), wtype, [d, 3 * d], 2));
        specs.push(TensorSpec::new(name(BLOCK_ROLES[2]), wtype, [d, d], 2));
        specs.push(norm(name(BLOCK_ROLES[3])));
        specs.push(TensorSpec::new(name(BLOCK_ROLES[4]), wtype, [d, 4 * d], 2));
        specs.push(TensorSpec::new(name(BLOCK_ROLES[5]), wtype, [4 * d, d], 2));
    }
    specs
}

/// A planned tensor and its place in the arena.
#[derive(Debug, Clone)]
struct Slot {
    spec: TensorSpec,
    offset: usize,
    nbytes: usize,
    filled: bool,
}

/// Single preallocated region holding every raw weight payload.
#[derive(Debug)]
pub struct WeightArena {
    data: Vec<u8>,
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
}

impl WeightArena {
    /// Plan every tensor for `hparams` and reserve the arena.
    ///
    /// The arena is the sum of the slot footprints plus [`TENSOR_OVERHEAD`]
    /// per tensor. Extents that overflow `usize`, or rows that are not a
    /// whole number of blocks, fail with
    /// [`EmberError::InvalidHyperparameters`].
    pub fn plan(hparams: &Hyperparameters) -> Result<Self> {
        let specs = planned_tensors(hparams);
        let mut slots = Vec::with_capacity(specs.len());
        let mut index = HashMap::with_capacity(specs.len());
        let mut offset = 0usize;

        for spec in specs {
            let nbytes = spec.n_bytes().ok_or_else(|| {
                EmberError::InvalidHyperparameters(format!(
                    "tensor '{}' with extents {:?} has no valid {:?} size",
                    spec.name, spec.ne, spec.dtype
                ))
            })?;
            let start = offset
                .checked_next_multiple_of(SLOT_ALIGN)
                .ok_or_else(|| arena_overflow(&spec.name))?;
            offset = start
                .checked_add(nbytes)
                .ok_or_else(|| arena_overflow(&spec.name))?;
            index.insert(spec.name.clone(), slots.len());
            slots.push(Slot {
                spec,
                offset: start,
                nbytes,
                filled: false,
            });
        }

        let payload = offset;
        let size = slots
            .len()
            .checked_mul(TENSOR_OVERHEAD)
            .and_then(|overhead| payload.checked_add(overhead))
            .ok_or(EmberError::OutOfMemory {
                requested: usize::MAX,
            })?;
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| EmberError::OutOfMemory { requested: size })?;
        data.resize(payload, 0);

        Ok(Self { data, slots, index })
    }

    /// Reserved size in bytes, including per-tensor overhead.
    pub fn size_bytes(&self) -> usize {
        self.data.capacity()
    }

    /// Number of planned tensors.
    pub fn n_tensors(&self) -> usize {
        self.slots.len()
    }

    /// Planned layout of a tensor.
    pub fn spec(&self, name: &str) -> Option<&TensorSpec> {
        self.index.get(name).map(|&i| &self.slots[i].spec)
    }

    fn slot(&self, name: &str) -> Result<&Slot> {
        self.index
            .get(name)
            .map(|&i| &self.slots[i])
            .ok_or_else(|| EmberError::MissingTensor(name.to_string()))
    }

    fn qtensor(&self, name: &str, device: &Device) -> Result<QTensor> {
        let slot = self.slot(name)?;
        let raw = &self.data[slot.offset..slot.offset + slot.nbytes];
        Ok(ggml_file::qtensor_from_ggml(
            slot.spec.dtype,
            raw,
            slot.spec.dims(),
            device,
        )?)
    }

    fn matmul(&self, name: &str, device: &Device) -> Result<QMatMul> {
        Ok(QMatMul::from_qtensor(self.qtensor(name, device)?)?)
    }

    fn norm(&self, name: &str, device: &Device) -> Result<LayerNorm> {
        let weight = self.qtensor(name, device)?.dequantize(device)?;
        LayerNorm::new(weight, LAYER_NORM_EPS)
    }
}

fn arena_overflow(name: &str) -> EmberError {
    EmberError::InvalidHyperparameters(format!("weight arena overflows at tensor '{name}'"))
}

/// Little-endian reader that maps short reads to [`EmberError::Truncated`].
struct LeReader<R> {
    inner: R,
}

impl<R: Read> LeReader<R> {
    fn new(inner: R) -> Self {
        Self { inner }
    }

    fn fill(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => EmberError::Truncated(what.to_string()),
            _ => EmberError::Io(e),
        })
    }

    fn read_u32(&mut self, what: &str) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf, what)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32(&mut self, what: &str) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf, what)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_f32(&mut self, what: &str) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf, what)?;
        Ok(f32::from_le_bytes(buf))
    }

    fn read_string(&mut self, len: usize, what: &str) -> Result<String> {
        let mut bytes = Vec::new();
        let got = (&mut self.inner).take(len as u64).read_to_end(&mut bytes)?;
        if got != len {
            return Err(EmberError::Truncated(what.to_string()));
        }
        String::from_utf8(bytes).map_err(|e| EmberError::InvalidVocab(format!("{what}: {e}")))
    }

    /// Read an `i32` at a record boundary; `None` on clean end of stream.
    fn next_record(&mut self) -> Result<Option<i32>> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        match filled {
            0 => Ok(None),
            4 => Ok(Some(i32::from_le_bytes(buf))),
            _ => Err(EmberError::Truncated("tensor record header".into())),
        }
    }
}

/// A loaded model and its vocabulary.
#[derive(Debug)]
pub struct Checkpoint {
    /// Model parameters.
    pub model: Model,
    /// Tokenizer built from the vocabulary section.
    pub tokenizer: Tokenizer,
}

impl Checkpoint {
    /// Load a checkpoint file onto the CPU.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading model");
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), &Device::Cpu)
    }

    /// Load a checkpoint from any byte stream.
    pub fn from_reader<R: Read>(reader: R, device: &Device) -> Result<Self> {
        let mut reader = LeReader::new(reader);

        let magic = reader.read_u32("magic")?;
        if magic != MAGIC {
            return Err(EmberError::BadMagic { found: magic });
        }

        let mut fields = [0i32; 6];
        for field in fields.iter_mut() {
            *field = reader.read_i32("hyperparameters")?;
        }
        let (hparams, quant_version) = Hyperparameters::from_header(fields)?;
        info!(
            embedding_dim = hparams.embedding_dim,
            max_sequence_len = hparams.max_sequence_len,
            n_heads = hparams.n_heads,
            n_layers = hparams.n_layers,
            n_vocab = hparams.n_vocab,
            float_encoding = ?hparams.float_encoding,
            quant_version,
            "read hyperparameters"
        );

        let tokenizer = read_vocab(&mut reader, hparams.n_vocab)?;

        let mut arena = WeightArena::plan(&hparams)?;
        info!(
            arena_mb = arena.size_bytes() as f64 / (1024.0 * 1024.0),
            n_tensors = arena.n_tensors(),
            "reserved weight arena"
        );

        let (n_tensors, bytes_loaded) = read_tensors(&mut reader, &mut arena)?;
        info!(
            model_mb = bytes_loaded as f64 / (1024.0 * 1024.0),
            n_tensors, "model loaded"
        );

        let metadata = ModelMetadata {
            hparams,
            quant_version,
            n_tensors,
            bytes_loaded,
        };
        let model = assemble(&arena, metadata, device)?;
        Ok(Self { model, tokenizer })
    }
}

fn read_vocab<R: Read>(reader: &mut LeReader<R>, n_vocab: usize) -> Result<Tokenizer> {
    let mut tokenizer = Tokenizer::new();
    for i in 0..n_vocab {
        let len = reader.read_u32("vocabulary entry length")? as usize;
        let text = reader.read_string(len, "vocabulary entry")?;
        let score = reader.read_f32("vocabulary score")?;
        // Stored negated so segmentation minimizes.
        let id = tokenizer.push(text, -score)?;
        debug_assert_eq!(id as usize, i);
    }
    Ok(tokenizer)
}

/// Stream tensor records into the arena. Returns (records, payload bytes).
fn read_tensors<R: Read>(
    reader: &mut LeReader<R>,
    arena: &mut WeightArena,
) -> Result<(usize, usize)> {
    let mut n_tensors = 0;
    let mut bytes_loaded = 0;

    while let Some(n_dims) = reader.next_record()? {
        let name_len = reader.read_i32("tensor name length")?;
        let tag = reader.read_i32("tensor type")?;
        // The name follows the extents, so it is unknown here.
        if !(1..=2).contains(&n_dims) {
            return Err(EmberError::TooManyDimensions { n_dims });
        }

        let mut ne = [1usize; 2];
        for extent in ne.iter_mut().take(n_dims as usize) {
            let raw = reader.read_i32("tensor extents")?;
            *extent = usize::try_from(raw).unwrap_or(0);
        }

        let name_len = usize::try_from(name_len)
            .ok()
            .filter(|&n| n > 0 && n <= MAX_NAME_LEN)
            .ok_or_else(|| EmberError::UnknownTensor(format!("<name of {name_len} bytes>")))?;
        let name = reader.read_string(name_len, "tensor name")?;

        let idx = *arena
            .index
            .get(&name)
            .ok_or_else(|| EmberError::UnknownTensor(name.clone()))?;
        let slot = &arena.slots[idx];
        if slot.filled {
            return Err(EmberError::DuplicateTensor(name));
        }
        let dtype = dtype_from_tag(tag).ok_or_else(|| EmberError::UnknownTensorType {
            name: name.clone(),
            tag,
        })?;

        let n_elements = ne[0].saturating_mul(ne[1]);
        if ne != slot.spec.ne {
            return Err(EmberError::ShapeMismatch {
                name,
                expected: slot.spec.ne,
                actual: ne,
            });
        }

        let declared = byte_footprint(dtype, n_elements);
        if declared != Some(slot.nbytes) {
            return Err(EmberError::SizeMismatch {
                name,
                expected: slot.nbytes,
                actual: n_elements.saturating_mul(dtype.type_size()) / dtype.block_size(),
            });
        }

        let (offset, nbytes) = (slot.offset, slot.nbytes);
        reader.fill(&mut arena.data[offset..offset + nbytes], &name)?;

        let slot = &mut arena.slots[idx];
        slot.spec.dtype = dtype;
        slot.filled = true;
        debug!(name = %name, ne = ?ne, dtype = ?dtype, bytes = nbytes, "loaded tensor");

        n_tensors += 1;
        bytes_loaded += nbytes;
    }

    if let Some(missing) = arena.slots.iter().find(|s| !s.filled) {
        return Err(EmberError::MissingTensor(missing.spec.name.clone()));
    }
    Ok((n_tensors, bytes_loaded))
}

fn assemble(arena: &WeightArena, metadata: ModelMetadata, device: &Device) -> Result<Model> {
    let hp = metadata.hparams.clone();

    // Tied embedding: dense copy for lookups, quantized for the output matmul.
    let wte = Arc::new(arena.qtensor(TOKEN_EMBEDDING, device)?);
    let embedding: Tensor = wte.dequantize(device)?;
    let lm_head = QMatMul::from_arc(wte)?;

    let mut layers = Vec::with_capacity(hp.n_layers);
    for il in 0..hp.n_layers {
        let name = |role| block_tensor_name(il, role);
        let attention = Attention::new(
            arena.matmul(&name(BLOCK_ROLES[1]), device)?,
            arena.matmul(&name(BLOCK_ROLES[2]), device)?,
            hp.n_heads,
            hp.head_dim(),
        );
        let mlp = GeluMlp::new(
            arena.matmul(&name(BLOCK_ROLES[4]), device)?,
            arena.matmul(&name(BLOCK_ROLES[5]), device)?,
        );
        layers.push(DecoderLayer::new(
            arena.norm(&name(BLOCK_ROLES[0]), device)?,
            attention,
            arena.norm(&name(BLOCK_ROLES[3]), device)?,
            mlp,
        ));
    }
    let norm_f = arena.norm(FINAL_NORM, device)?;

    Ok(Model::new(
        metadata,
        embedding,
        lm_head,
        layers,
        norm_f,
        device.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FloatEncoding, LogitsMode, ScratchArena};
    use crate::testing::{
        block_hparams, checkpoint_bytes, encode_matrix, toy_checkpoint_bytes, toy_hparams,
        CheckpointWriter,
    };
    use std::io::Cursor;

    fn load(bytes: Vec<u8>) -> Result<Checkpoint> {
        Checkpoint::from_reader(Cursor::new(bytes), &Device::Cpu)
    }

    fn last_logits(checkpoint: &Checkpoint, tokens: &[u32]) -> Vec<f32> {
        let model = &checkpoint.model;
        let mut cache = model.new_cache(false).unwrap();
        let mut scratch = ScratchArena::new();
        model
            .forward(tokens, 0, &mut cache, &mut scratch, LogitsMode::Last)
            .unwrap()
    }

    fn planned_payload(hparams: &Hyperparameters) -> usize {
        planned_tensors(hparams)
            .iter()
            .map(|spec| spec.n_bytes().unwrap())
            .sum()
    }

    /// Loads `encoding` and the F32 model with the same weights; checks the
    /// payload size and that logits stay within `tolerance`.
    fn check_encoded_model(encoding: FloatEncoding, tolerance: f32) {
        let reference_hp = block_hparams(FloatEncoding::AllF32);
        let hp = block_hparams(encoding);
        let reference = load(checkpoint_bytes(&reference_hp, 4)).unwrap();
        let encoded = load(checkpoint_bytes(&hp, 4)).unwrap();

        let loaded = encoded.model.metadata().bytes_loaded;
        assert_eq!(loaded, planned_payload(&hp));
        assert!(loaded < reference.model.metadata().bytes_loaded);
        assert_eq!(encoded.model.hparams().float_encoding, encoding);

        let tokens = [1u32, 5, 9, 13];
        let want = last_logits(&reference, &tokens);
        let got = last_logits(&encoded, &tokens);
        assert_eq!(got.len(), hp.n_vocab);
        for (a, b) in want.iter().zip(&got) {
            assert!(b.is_finite());
            assert!((a - b).abs() < tolerance, "{encoding:?}: {a} vs {b}");
        }
    }

    /// A valid header and vocabulary with no tensors yet.
    fn header_only() -> CheckpointWriter {
        let mut w = CheckpointWriter::new(&toy_hparams());
        w.toy_vocab();
        w
    }

    #[test]
    fn loads_toy_checkpoint() {
        let checkpoint = load(toy_checkpoint_bytes(1)).unwrap();
        let hp = toy_hparams();
        let meta = checkpoint.model.metadata();
        assert_eq!(meta.hparams, hp);
        assert_eq!(meta.n_tensors, 2 + 6 * hp.n_layers);
        assert!(meta.bytes_loaded > 0);
        assert_eq!(checkpoint.tokenizer.vocab_size(), hp.n_vocab);
        assert_eq!(checkpoint.model.layers().len(), hp.n_layers);
    }

    #[test]
    fn scores_are_negated() {
        let checkpoint = load(toy_checkpoint_bytes(1)).unwrap();
        let entry = checkpoint.tokenizer.entry("a").unwrap();
        // The fixture writes log-probabilities of -(id) / 10.
        assert!((entry.score - entry.id as f32 / 10.0).abs() < 1e-6);
    }

    #[test]
    fn load_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), toy_checkpoint_bytes(2)).unwrap();
        let checkpoint = Checkpoint::load(file.path()).unwrap();
        assert_eq!(checkpoint.model.hparams().n_layers, 2);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = toy_checkpoint_bytes(1);
        bytes[0] ^= 0xff;
        let err = load(bytes).unwrap_err();
        assert!(matches!(err, EmberError::BadMagic { .. }));
    }

    #[test]
    fn rejects_unknown_float_type() {
        let mut bytes = toy_checkpoint_bytes(1);
        // ftype is the sixth header field.
        bytes[24..28].copy_from_slice(&5i32.to_le_bytes());
        let err = load(bytes).unwrap_err();
        assert!(matches!(err, EmberError::UnknownFloatType(5)));
    }

    #[test]
    fn quant_version_recorded() {
        let mut bytes = toy_checkpoint_bytes(1);
        bytes[24..28].copy_from_slice(&1000i32.to_le_bytes());
        let checkpoint = load(bytes).unwrap();
        assert_eq!(checkpoint.model.metadata().quant_version, 1);
        assert_eq!(
            checkpoint.model.hparams().float_encoding,
            FloatEncoding::AllF32
        );
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut bytes = toy_checkpoint_bytes(1);
        bytes.truncate(bytes.len() - 10);
        let err = load(bytes).unwrap_err();
        assert!(matches!(err, EmberError::Truncated(_)), "{err}");
    }

    #[test]
    fn rejects_truncated_record_header() {
        let mut w = header_only();
        w.raw(&[1, 0]);
        let err = load(w.finish()).unwrap_err();
        assert!(matches!(err, EmberError::Truncated(_)));
    }

    #[test]
    fn rejects_truncated_vocab() {
        let mut bytes = CheckpointWriter::new(&toy_hparams()).finish();
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(b"ab");
        let err = load(bytes).unwrap_err();
        assert!(matches!(err, EmberError::Truncated(_)));
    }

    #[test]
    fn rejects_unknown_tensor() {
        let mut w = header_only();
        w.tensor_f32("transformer.bogus.weight", &[16], &[0.0; 16]);
        let err = load(w.finish()).unwrap_err();
        assert!(matches!(err, EmberError::UnknownTensor(name) if name == "transformer.bogus.weight"));
    }

    #[test]
    fn rejects_shape_mismatch_before_payload() {
        let mut w = header_only();
        // Right element count, transposed extents; no payload follows.
        w.tensor_header(TOKEN_EMBEDDING, 0, &[toy_hparams().n_vocab, 16]);
        let err = load(w.finish()).unwrap_err();
        assert!(matches!(err, EmberError::ShapeMismatch { .. }), "{err}");
    }

    #[test]
    fn rejects_size_mismatch() {
        let mut w = header_only();
        // F16 tag where F32 is planned.
        w.tensor_header(FINAL_NORM, 1, &[16]);
        let err = load(w.finish()).unwrap_err();
        assert!(
            matches!(err, EmberError::SizeMismatch { expected: 64, actual: 32, .. }),
            "{err}"
        );
    }

    #[test]
    fn rejects_unknown_type_tag() {
        let mut w = header_only();
        w.tensor_header(FINAL_NORM, 4, &[16]);
        let err = load(w.finish()).unwrap_err();
        assert!(matches!(err, EmberError::UnknownTensorType { tag: 4, .. }));
    }

    #[test]
    fn rejects_three_dimensions() {
        let mut w = header_only();
        w.tensor_header(FINAL_NORM, 0, &[16, 1, 1]);
        let err = load(w.finish()).unwrap_err();
        assert!(matches!(err, EmberError::TooManyDimensions { n_dims: 3 }));
        assert_eq!(err.to_string(), "tensor record has 3 dimensions, expected 1 or 2");

        let mut w = header_only();
        w.tensor_header(FINAL_NORM, 0, &[]);
        let err = load(w.finish()).unwrap_err();
        assert!(matches!(err, EmberError::TooManyDimensions { n_dims: 0 }));
    }

    #[test]
    fn rejects_missing_tensor() {
        let mut w = header_only();
        w.tensor_f32(FINAL_NORM, &[16], &[1.0; 16]);
        let err = load(w.finish()).unwrap_err();
        assert!(matches!(err, EmberError::MissingTensor(_)));
    }

    #[test]
    fn rejects_duplicate_tensor() {
        let mut w = header_only();
        w.tensor_f32(FINAL_NORM, &[16], &[1.0; 16]);
        w.tensor_f32(FINAL_NORM, &[16], &[1.0; 16]);
        let err = load(w.finish()).unwrap_err();
        assert!(matches!(err, EmberError::DuplicateTensor(_)));
    }

    #[test]
    fn loads_and_runs_f16_weights() {
        check_encoded_model(FloatEncoding::MostlyF16, 2e-2);
    }

    #[test]
    fn loads_and_runs_q8_0_weights() {
        check_encoded_model(FloatEncoding::MostlyQ8_0, 0.3);
    }

    #[test]
    fn rejects_tag_with_wrong_block_footprint() {
        let hp = block_hparams(FloatEncoding::MostlyQ8_0);

        // F32 tag on a Q8_0 matrix: 32x32 floats against 32 blocks of 34 bytes.
        let mut w = CheckpointWriter::new(&hp);
        w.toy_vocab();
        w.tensor_header(TOKEN_EMBEDDING, 0, &[32, 32]);
        let err = load(w.finish()).unwrap_err();
        assert!(
            matches!(err, EmberError::SizeMismatch { expected: 1088, actual: 4096, .. }),
            "{err}"
        );

        // Q8_0 tag on a norm, which is always F32.
        let mut w = CheckpointWriter::new(&hp);
        w.toy_vocab();
        w.tensor_header(FINAL_NORM, 8, &[32]);
        let err = load(w.finish()).unwrap_err();
        assert!(
            matches!(err, EmberError::SizeMismatch { expected: 128, actual: 34, .. }),
            "{err}"
        );
    }

    #[test]
    fn rejects_short_q8_0_payload() {
        let hp = block_hparams(FloatEncoding::MostlyQ8_0);
        let payload = encode_matrix(GgmlDType::Q8_0, [32, 32], vec![0.1; 32 * 32]);
        assert_eq!(payload.len(), 1088);

        let mut w = CheckpointWriter::new(&hp);
        w.toy_vocab();
        w.tensor_raw(TOKEN_EMBEDDING, 8, &[32, 32], &payload[..1000]);
        let err = load(w.finish()).unwrap_err();
        assert!(matches!(err, EmberError::Truncated(_)), "{err}");
    }

    #[test]
    fn rejects_header_whose_sizes_overflow() {
        let hp = Hyperparameters {
            embedding_dim: 1 << 30,
            max_sequence_len: 8,
            n_heads: 1,
            n_layers: 1,
            n_vocab: 1,
            float_encoding: FloatEncoding::AllF32,
        };
        let mut w = CheckpointWriter::new(&hp);
        w.vocab_entry("<|endoftext|>", 0.0);
        let err = load(w.finish()).unwrap_err();
        assert!(matches!(err, EmberError::InvalidHyperparameters(_)), "{err}");
        assert_eq!(err.category(), crate::error::ErrorCategory::Format);
    }

    #[test]
    fn plan_rejects_rows_that_split_blocks() {
        // 16-wide rows cannot hold 32-element Q8_0 blocks.
        let hp = Hyperparameters {
            float_encoding: FloatEncoding::MostlyQ8_0,
            ..toy_hparams()
        };
        let err = WeightArena::plan(&hp).unwrap_err();
        assert!(matches!(err, EmberError::InvalidHyperparameters(_)), "{err}");
    }

    #[test]
    fn plan_is_canonical_and_aligned() {
        let hp = toy_hparams();
        let arena = WeightArena::plan(&hp).unwrap();
        assert_eq!(arena.n_tensors(), 2 + 6 * hp.n_layers);
        assert!(arena.slots.iter().all(|s| s.offset % SLOT_ALIGN == 0));

        let payload: usize = arena.slots.iter().map(|s| s.nbytes).sum();
        assert!(arena.size_bytes() >= payload + arena.n_tensors() * TENSOR_OVERHEAD);

        let qkv = arena.spec("transformer.blocks.1.attn.Wqkv.weight").unwrap();
        assert_eq!(qkv.ne, [16, 48]);
        let down = arena.spec("transformer.blocks.0.ffn.down_proj.weight").unwrap();
        assert_eq!(down.ne, [64, 16]);
        assert_eq!(arena.spec(FINAL_NORM).unwrap().n_dims, 1);
    }
}

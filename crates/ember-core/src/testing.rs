//! Synthetic checkpoints for tests.
//!
//! Builds small, fully valid checkpoint streams with seeded random weights so
//! loader, forward pass and session tests can run without a real model.

use crate::model::{
    dtype_from_tag, planned_tensors, Checkpoint, FloatEncoding, Hyperparameters, Model, MAGIC,
};
use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Cursor;

/// Vocabulary of the toy model; id 0 is end-of-text.
pub const TOY_VOCAB: [&str; 32] = [
    "<|endoftext|>",
    "\u{2581}",
    "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m", "n", "o", "p", "q", "r",
    "s", "t", "u", "v", "w", "x", "y", "z",
    "\u{2581}the",
    "he",
    "ll",
    "o\u{2581}",
];

/// 2 layers, 4 heads, 16 dims, 32 positions, F32 weights.
pub fn toy_hparams() -> Hyperparameters {
    Hyperparameters {
        embedding_dim: 16,
        max_sequence_len: 32,
        n_heads: 4,
        n_layers: 2,
        n_vocab: TOY_VOCAB.len(),
        float_encoding: FloatEncoding::AllF32,
    }
}

/// Incremental writer for checkpoint streams.
#[derive(Debug, Default)]
pub struct CheckpointWriter {
    buf: Vec<u8>,
}

impl CheckpointWriter {
    /// Start a stream with the magic and header for `hparams`.
    pub fn new(hparams: &Hyperparameters) -> Self {
        let mut w = Self::default();
        w.u32(MAGIC);
        for v in [
            hparams.embedding_dim,
            hparams.max_sequence_len,
            hparams.n_heads,
            hparams.n_layers,
            hparams.n_vocab,
        ] {
            w.i32(v as i32);
        }
        w.i32(hparams.float_encoding.as_raw());
        w
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append raw bytes.
    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append one vocabulary record.
    pub fn vocab_entry(&mut self, text: &str, score: f32) {
        self.u32(text.len() as u32);
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.extend_from_slice(&score.to_le_bytes());
    }

    /// Append [`TOY_VOCAB`] with log-probability `-id / 10`.
    pub fn toy_vocab(&mut self) {
        for (id, text) in TOY_VOCAB.iter().enumerate() {
            self.vocab_entry(text, -(id as f32) / 10.0);
        }
    }

    /// Append a tensor record header without payload.
    pub fn tensor_header(&mut self, name: &str, tag: i32, ne: &[usize]) {
        self.i32(ne.len() as i32);
        self.i32(name.len() as i32);
        self.i32(tag);
        for &extent in ne {
            self.i32(extent as i32);
        }
        self.buf.extend_from_slice(name.as_bytes());
    }

    /// Append a complete F32 tensor record.
    pub fn tensor_f32(&mut self, name: &str, ne: &[usize], data: &[f32]) {
        self.tensor_header(name, 0, ne);
        for v in data {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    /// Append a tensor record with an already encoded payload.
    pub fn tensor_raw(&mut self, name: &str, tag: i32, ne: &[usize], payload: &[u8]) {
        self.tensor_header(name, tag, ne);
        self.buf.extend_from_slice(payload);
    }

    /// Finish the stream.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// 1 layer, 4 heads, 32 dims, 16 positions; rows fit whole quantization blocks.
pub fn block_hparams(float_encoding: FloatEncoding) -> Hyperparameters {
    Hyperparameters {
        embedding_dim: 32,
        max_sequence_len: 16,
        n_heads: 4,
        n_layers: 1,
        n_vocab: TOY_VOCAB.len(),
        float_encoding,
    }
}

/// Type tag of `dtype` in a tensor record.
pub fn type_tag(dtype: GgmlDType) -> i32 {
    (0..=15)
        .find(|&tag| dtype_from_tag(tag) == Some(dtype))
        .unwrap_or_else(|| panic!("no record tag for {dtype:?}"))
}

/// Encode a 2-d matrix with extents `[ne0, ne1]` (innermost first) as `dtype`.
pub fn encode_matrix(dtype: GgmlDType, ne: [usize; 2], data: Vec<f32>) -> Vec<u8> {
    let tensor = Tensor::from_vec(data, (ne[1], ne[0]), &Device::Cpu).expect("matrix shape");
    let qtensor = QTensor::quantize(&tensor, dtype).expect("rows fit whole blocks");
    qtensor.data().expect("cpu storage").into_owned()
}

/// A complete checkpoint for `hparams` with weights drawn from `seed`.
///
/// Matrices use the weight element type of the float encoding. The random
/// draws do not depend on the encoding, so two encodings of the same
/// `hparams` and `seed` hold the same underlying weights. `hparams.n_vocab`
/// must equal the length of [`TOY_VOCAB`].
pub fn checkpoint_bytes(hparams: &Hyperparameters, seed: u64) -> Vec<u8> {
    assert_eq!(hparams.n_vocab, TOY_VOCAB.len());
    let mut rng = StdRng::seed_from_u64(seed);
    let mut w = CheckpointWriter::new(hparams);
    w.toy_vocab();

    for spec in planned_tensors(hparams) {
        let n = spec.n_elements().expect("toy sizes fit");
        let ne = &spec.ne[..spec.n_dims];
        if spec.n_dims == 1 {
            let data: Vec<f32> = (0..n).map(|_| 1.0 + rng.gen_range(-0.1..0.1)).collect();
            w.tensor_f32(&spec.name, ne, &data);
            continue;
        }
        let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-0.3..0.3)).collect();
        if spec.dtype == GgmlDType::F32 {
            w.tensor_f32(&spec.name, ne, &data);
        } else {
            let payload = encode_matrix(spec.dtype, spec.ne, data);
            w.tensor_raw(&spec.name, type_tag(spec.dtype), ne, &payload);
        }
    }
    w.finish()
}

/// A complete toy checkpoint with weights drawn from `seed`.
pub fn toy_checkpoint_bytes(seed: u64) -> Vec<u8> {
    checkpoint_bytes(&toy_hparams(), seed)
}

/// Load the toy checkpoint for `seed`.
pub fn toy_checkpoint(seed: u64) -> Checkpoint {
    Checkpoint::from_reader(Cursor::new(toy_checkpoint_bytes(seed)), &Device::Cpu)
        .expect("toy checkpoint is valid")
}

/// Load only the toy model for `seed`.
pub fn toy_model(seed: u64) -> Model {
    toy_checkpoint(seed).model
}

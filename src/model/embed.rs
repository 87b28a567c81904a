//! Input stage shared by both predictors.
//!
//! ```text
//! x [B, N, dim] ─────────────────────────────────┐
//! phoneme_ids [B, N] → Embedding(vocab + 1, emb) ─┼─ cat → Linear(2·dim + emb, dim) → + ConvPositionEmbed
//! cond [B, N, dim] ───────────────────────────────┘
//! ```
//!
//! `to_embed` reads columns `[0, dim)` from `x`, `[dim, dim + emb)` from the
//! phoneme embedding and the rest from `cond`.
//!
//! The extra embedding row belongs to the null phoneme id used by guidance
//! dropout; the learned null conditioning vector lives here too.

use candle_core::{Module, Tensor, D};
use candle_nn::{Embedding, Linear, VarBuilder};
use rand::Rng;

use super::guidance;
use super::transformer::conv_pos::ConvPositionEmbed;
use crate::Result;

#[derive(Debug, Clone)]
pub struct FrameEmbed {
    to_phoneme_emb: Embedding,
    to_embed: Linear,
    null_cond: Tensor,
    conv_embed: ConvPositionEmbed,
    null_phoneme_id: u32,
    dim: usize,
}

impl FrameEmbed {
    pub fn new(
        num_phoneme_tokens: usize,
        dim_phoneme_emb: usize,
        dim: usize,
        conv_kernel_size: usize,
        conv_groups: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let to_phoneme_emb =
            candle_nn::embedding(num_phoneme_tokens + 1, dim_phoneme_emb, vb.pp("to_phoneme_emb"))?;
        let to_embed = candle_nn::linear(dim * 2 + dim_phoneme_emb, dim, vb.pp("to_embed"))?;
        let null_cond = vb.get_with_hints(dim, "null_cond", candle_nn::Init::Const(0.0))?;
        let conv_embed = ConvPositionEmbed::new(dim, conv_kernel_size, conv_groups, vb.pp("conv_embed"))?;
        Ok(Self {
            to_phoneme_emb,
            to_embed,
            null_cond,
            conv_embed,
            null_phoneme_id: num_phoneme_tokens as u32,
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn null_phoneme_id(&self) -> u32 {
        self.null_phoneme_id
    }

    /// Validate inputs, apply guidance dropout and embed to `[B, N, dim]`.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        x: &Tensor,
        phoneme_ids: &Tensor,
        cond: &Tensor,
        cond_drop_prob: f64,
        rng: &mut R,
    ) -> Result<Tensor> {
        guidance::check_inputs(x, phoneme_ids, cond, self.dim)?;
        let cond = guidance::drop_conditioning(
            phoneme_ids,
            cond,
            &self.null_cond,
            self.null_phoneme_id,
            cond_drop_prob,
            rng,
        )?;

        let phoneme_emb = self.to_phoneme_emb.forward(&cond.phoneme_ids)?.to_dtype(x.dtype())?;
        let cond_emb = cond.cond.to_dtype(x.dtype())?;
        let x = Tensor::cat(&[x, &phoneme_emb, &cond_emb], D::Minus1)?;
        let x = self.to_embed.forward(&x)?;
        Ok((self.conv_embed.forward(&x)? + x)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn embeds_to_model_width() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let embed = FrameEmbed::new(10, 8, 16, 5, None, vb).unwrap();
        assert_eq!(embed.null_phoneme_id(), 10);

        let x = Tensor::randn(0f32, 1.0, (2, 7, 16), &dev).unwrap();
        let cond = Tensor::randn(0f32, 1.0, (2, 7, 16), &dev).unwrap();
        let ids = Tensor::zeros((2, 7), DType::U32, &dev).unwrap();
        let mut rng = crate::rng::seeded(0);
        let out = embed.forward(&x, &ids, &cond, 0.5, &mut rng).unwrap();
        assert_eq!(out.dims(), &[2, 7, 16]);
    }

    #[test]
    fn null_id_has_its_own_row() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        FrameEmbed::new(10, 8, 16, 5, None, vb).unwrap();
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["to_phoneme_emb.weight"].dims(), &[11, 8]);
        assert_eq!(data["null_cond"].dims(), &[16]);
    }

    /// Zero every parameter, then open a single input slot of `to_embed`.
    fn embed_reading_columns(cols: std::ops::Range<usize>) -> FrameEmbed {
        let dev = Device::Cpu;
        let (dim, emb) = (4, 3);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let embed = FrameEmbed::new(5, emb, dim, 3, None, vb).unwrap();
        let data = varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            let value = if name == "to_embed.weight" {
                let col_mask: Vec<f32> = (0..2 * dim + emb)
                    .map(|c| if cols.contains(&c) { 1.0 } else { 0.0 })
                    .collect();
                Tensor::new(col_mask.as_slice(), &dev)
                    .unwrap()
                    .broadcast_as((dim, 2 * dim + emb))
                    .unwrap()
                    .contiguous()
                    .unwrap()
            } else if name == "to_phoneme_emb.weight" {
                var.ones_like().unwrap()
            } else {
                var.zeros_like().unwrap()
            };
            var.set(&value).unwrap();
        }
        embed
    }

    fn output_change(embed: &FrameEmbed, change_cond: bool) -> f32 {
        let dev = Device::Cpu;
        let zeros = Tensor::zeros((1, 2, 4), DType::F32, &dev).unwrap();
        let ones = zeros.ones_like().unwrap();
        let ids_a = Tensor::zeros((1, 2), DType::U32, &dev).unwrap();
        let mut rng = crate::rng::seeded(0);
        let base = embed.forward(&zeros, &ids_a, &zeros, 0.0, &mut rng).unwrap();
        let moved = if change_cond {
            embed.forward(&zeros, &ids_a, &ones, 0.0, &mut rng).unwrap()
        } else {
            embed.forward(&ones, &ids_a, &zeros, 0.0, &mut rng).unwrap()
        };
        (moved - base).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap()
    }

    #[test]
    fn projection_columns_follow_x_phoneme_cond_order() {
        // dim = 4, emb = 3: x → [0, 4), phonemes → [4, 7), cond → [7, 11).
        let phoneme_slot = embed_reading_columns(4..7);
        assert_eq!(output_change(&phoneme_slot, true), 0.0);
        assert_eq!(output_change(&phoneme_slot, false), 0.0);

        let cond_slot = embed_reading_columns(7..11);
        // Each of 2 frames × 4 outputs sums 4 ones.
        assert_eq!(output_change(&cond_slot, true), 32.0);
        assert_eq!(output_change(&cond_slot, false), 0.0);

        let x_slot = embed_reading_columns(0..4);
        assert_eq!(output_change(&x_slot, true), 0.0);
        assert_eq!(output_change(&x_slot, false), 32.0);
    }
}

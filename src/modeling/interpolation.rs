use candle_core::{DType, Device, Tensor};
use ndarray::Array3;

use crate::error::{shape_mismatch, Result};

/// Bilinearly resizes a stack of planes shaped `[planes, height, width]`
/// (half-pixel centers, edges clamped).
pub fn bilinear_interpolate(input: &Array3<f32>, output_h: usize, output_w: usize) -> Array3<f32> {
    let (planes, in_h, in_w) = input.dim();
    let mut output = Array3::<f32>::zeros((planes, output_h, output_w));
    if in_h == 0 || in_w == 0 {
        return output;
    }
    let scale_h = in_h as f32 / output_h as f32;
    let scale_w = in_w as f32 / output_w as f32;
    output.indexed_iter_mut().for_each(|((p, y, x), val)| {
        let y_in = ((y as f32 + 0.5) * scale_h - 0.5).clamp(0.0, (in_h - 1) as f32);
        let x_in = ((x as f32 + 0.5) * scale_w - 0.5).clamp(0.0, (in_w - 1) as f32);
        let y0 = y_in.floor() as usize;
        let x0 = x_in.floor() as usize;
        let y1 = (y0 + 1).min(in_h - 1);
        let x1 = (x0 + 1).min(in_w - 1);
        let dy = y_in - y0 as f32;
        let dx = x_in - x0 as f32;

        let f00 = input[[p, y0, x0]];
        let f01 = input[[p, y0, x1]];
        let f10 = input[[p, y1, x0]];
        let f11 = input[[p, y1, x1]];
        *val = (1.0 - dx) * (1.0 - dy) * f00
            + dx * (1.0 - dy) * f01
            + (1.0 - dx) * dy * f10
            + dx * dy * f11;
    });
    output
}

/// Resizes a channels-last mask prompt `(batch, num_masks, H, W, 1)` to
/// `(batch, num_masks, size.0, size.1, 1)`.
///
/// The result lives on the device of the input.
pub fn resize_mask_prompt(masks: &Tensor, size: (usize, usize)) -> Result<Tensor> {
    let (b, n, h, w, c) = masks
        .dims5()
        .map_err(|_| shape_mismatch(format!("expected a 5-d mask prompt, got {:?}", masks.dims())))?;
    if c != 1 {
        return Err(shape_mismatch(format!(
            "mask prompts must have a single channel, got {c}"
        )));
    }
    let (out_h, out_w) = size;
    if masks.elem_count() == 0 || (h, w) == (out_h, out_w) {
        return Ok(masks.clone());
    }

    let data = masks
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let planes = Array3::from_shape_vec((b * n, h, w), data)
        .map_err(|e| shape_mismatch(format!("mask prompt layout: {e}")))?;
    let resized = bilinear_interpolate(&planes, out_h, out_w);
    let data: Vec<f32> = resized.into_iter().collect();
    Ok(Tensor::from_vec(data, (b, n, out_h, out_w, 1), masks.device())?)
}

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::{Array, Array4};

pub const NSFW_INPUT_SIZE: u32 = 224;
const RESIZE_TO: u32 = 256;
const BGR_MEAN: [f32; 3] = [104.0, 117.0, 123.0];

/// Caffe-style preprocessing for the open NSFW model: resize to 256x256,
/// center-crop 224x224, BGR channel order, per-channel mean subtracted.
/// Output layout is NHWC.
pub fn normalize_for_nsfw(image: &DynamicImage) -> Array4<f32> {
    let offset = (RESIZE_TO - NSFW_INPUT_SIZE) / 2;
    let cropped = image
        .resize_exact(RESIZE_TO, RESIZE_TO, FilterType::Triangle)
        .crop_imm(offset, offset, NSFW_INPUT_SIZE, NSFW_INPUT_SIZE)
        .to_rgb8();

    let size = NSFW_INPUT_SIZE as usize;
    let mut array = Array::zeros((1, size, size, 3));
    for (x, y, pixel) in cropped.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        array[[0, y, x, 0]] = pixel[2] as f32 - BGR_MEAN[0];
        array[[0, y, x, 1]] = pixel[1] as f32 - BGR_MEAN[1];
        array[[0, y, x, 2]] = pixel[0] as f32 - BGR_MEAN[2];
    }
    array
}

/// The model emits `[sfw, nsfw]`; anything else means no probability.
pub fn nsfw_probability<I: IntoIterator<Item = f32>>(scores: I) -> Option<f32> {
    let scores: Vec<f32> = scores.into_iter().collect();
    match scores.as_slice() {
        [_, nsfw] if nsfw.is_finite() => Some(nsfw.clamp(0.0, 1.0)),
        _ => None,
    }
}
